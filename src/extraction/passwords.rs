/// Passwords to try on an encrypted archive, in order, without duplicates
///
/// Sources are tried as: the password given with the job, the NZB's
/// `password` meta entry, then the empty password when enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasswordList {
    passwords: Vec<String>,
}

impl PasswordList {
    /// Collect the password candidates for a job
    pub fn collect(job_password: Option<&str>, nzb_password: Option<&str>, try_empty: bool) -> Self {
        let mut passwords: Vec<String> = Vec::new();
        for pw in [job_password, nzb_password].into_iter().flatten() {
            if !passwords.iter().any(|p| p == pw) {
                passwords.push(pw.to_string());
            }
        }
        if try_empty && !passwords.iter().any(String::is_empty) {
            passwords.push(String::new());
        }
        Self { passwords }
    }

    /// Candidates in the order they are tried
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.passwords.iter().map(String::as_str)
    }

    /// Whether there is nothing to try
    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.passwords.len()
    }
}
