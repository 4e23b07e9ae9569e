use super::*;
use tempfile::TempDir;

fn create_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = ::zip::ZipWriter::new(file);
    let options =
        ::zip::write::FileOptions::default().compression_method(::zip::CompressionMethod::Stored);
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        std::io::Write::write_all(&mut writer, content).unwrap();
    }
    writer.finish().unwrap();
}

fn create_encrypted_zip(path: &Path, name: &str, content: &[u8], password: &[u8]) {
    use ::zip::unstable::write::FileOptionsExt;
    let file = std::fs::File::create(path).unwrap();
    let mut writer = ::zip::ZipWriter::new(file);
    let options = ::zip::write::FileOptions::default()
        .compression_method(::zip::CompressionMethod::Stored)
        .with_deprecated_encryption(password);
    writer.start_file(name, options).unwrap();
    std::io::Write::write_all(&mut writer, content).unwrap();
    writer.finish().unwrap();
}

#[test]
fn detects_entry_points_only() {
    assert_eq!(detect_format(Path::new("a.rar")), Some(ArchiveFormat::Rar));
    assert_eq!(
        detect_format(Path::new("a.part01.rar")),
        Some(ArchiveFormat::Rar)
    );
    assert_eq!(detect_format(Path::new("a.part1.RAR")), Some(ArchiveFormat::Rar));
    assert_eq!(detect_format(Path::new("a.part02.rar")), None);
    assert_eq!(detect_format(Path::new("a.r00")), None);
    assert_eq!(detect_format(Path::new("a.7z")), Some(ArchiveFormat::SevenZip));
    assert_eq!(
        detect_format(Path::new("a.7z.001")),
        Some(ArchiveFormat::SevenZip)
    );
    assert_eq!(detect_format(Path::new("a.7z.002")), None);
    assert_eq!(detect_format(Path::new("a.ZIP")), Some(ArchiveFormat::Zip));
    assert_eq!(detect_format(Path::new("a.mkv")), None);
}

#[test]
fn continuation_volumes_are_recognised() {
    assert!(is_archive_volume(Path::new("a.part02.rar")));
    assert!(is_archive_volume(Path::new("a.r07")));
    assert!(is_archive_volume(Path::new("a.7z.001")));
    assert!(!is_archive_volume(Path::new("a.mp4")));
}

#[test]
fn password_list_order_and_dedup() {
    let list = PasswordList::collect(Some("job"), Some("nzb"), true);
    assert_eq!(list.iter().collect::<Vec<_>>(), vec!["job", "nzb", ""]);

    let list = PasswordList::collect(Some("same"), Some("same"), false);
    assert_eq!(list.len(), 1);

    assert!(PasswordList::collect(None, None, false).is_empty());
}

#[test]
fn unsafe_entry_paths_are_normalised() {
    assert_eq!(
        safe_relative(Path::new("../../etc/passwd")),
        Some(PathBuf::from("etc/passwd"))
    );
    assert_eq!(safe_relative(Path::new("..")), None);
}

#[tokio::test]
async fn media_passes_through_unchanged() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in/movie.mkv");
    std::fs::create_dir_all(input.parent().unwrap()).unwrap();
    std::fs::write(&input, b"matroska").unwrap();
    let dest = dir.path().join("out");

    let outputs = ExtractionStage
        .extract(&[input.clone()], &dir.path().join("staging"), &dest, &PasswordList::default())
        .await
        .unwrap();

    assert_eq!(outputs, vec![dest.join("movie.mkv")]);
    assert_eq!(std::fs::read(&outputs[0]).unwrap(), b"matroska");
    assert!(!input.exists());
}

#[tokio::test]
async fn zip_payload_is_unpacked() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("release.zip");
    create_zip(
        &archive,
        &[("movie.mkv", b"video"), ("subs/movie.srt", b"1\n00:00")],
    );
    let dest = dir.path().join("out");

    let mut outputs = ExtractionStage
        .extract(&[archive.clone()], &dir.path().join("staging"), &dest, &PasswordList::default())
        .await
        .unwrap();
    outputs.sort();

    assert_eq!(
        outputs,
        vec![dest.join("movie.mkv"), dest.join("subs/movie.srt")]
    );
    assert_eq!(std::fs::read(dest.join("movie.mkv")).unwrap(), b"video");
    assert!(!dir.path().join("staging").exists());
    // Archives stay behind in the input location
    assert!(archive.exists());
}

#[tokio::test]
async fn encrypted_zip_tries_passwords_in_order() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("locked.zip");
    create_encrypted_zip(&archive, "movie.mkv", b"secret video", b"hunter2");
    let dest = dir.path().join("out");

    let outputs = ExtractionStage
        .extract(
            &[archive],
            &dir.path().join("staging"),
            &dest,
            &PasswordList::collect(Some("wrong"), Some("hunter2"), true),
        )
        .await
        .unwrap();

    assert_eq!(outputs, vec![dest.join("movie.mkv")]);
    assert_eq!(std::fs::read(&outputs[0]).unwrap(), b"secret video");
}

#[tokio::test]
async fn corrupt_archive_fails_and_keeps_inputs() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("broken.zip");
    std::fs::write(&archive, b"PK not really").unwrap();
    let media = dir.path().join("sample.mkv");
    std::fs::write(&media, b"sample").unwrap();
    let dest = dir.path().join("out");

    let err = ExtractionStage
        .extract(
            &[archive.clone(), media.clone()],
            &dir.path().join("staging"),
            &dest,
            &PasswordList::default(),
        )
        .await
        .unwrap_err();

    match err {
        Error::Job(JobError::ExtractionFailure { archive: failed, .. }) => {
            assert_eq!(failed, archive)
        }
        other => panic!("expected extraction failure, got {other:?}"),
    }
    assert!(archive.exists());
    assert!(media.exists(), "pass-through files are only moved after archives succeed");
}

#[tokio::test]
async fn sevenz_payload_is_unpacked() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("src");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("episode.mkv"), b"episode").unwrap();
    let archive = dir.path().join("episode.7z");
    sevenz_rust::compress_to_path(&source, &archive).unwrap();
    let dest = dir.path().join("out");

    let outputs = ExtractionStage
        .extract(&[archive], &dir.path().join("staging"), &dest, &PasswordList::default())
        .await
        .unwrap();

    assert_eq!(outputs.len(), 1);
    assert_eq!(std::fs::read(&outputs[0]).unwrap(), b"episode");
}

#[tokio::test]
async fn failed_archive_leaves_destination_untouched() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("a.zip");
    create_zip(&good, &[("movie.mkv", b"video")]);
    let bad = dir.path().join("b.zip");
    std::fs::write(&bad, b"PK not really").unwrap();
    let dest = dir.path().join("out");
    let staging = dir.path().join("staging");

    let err = ExtractionStage
        .extract(
            &[good.clone(), bad.clone()],
            &staging,
            &dest,
            &PasswordList::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Job(JobError::ExtractionFailure { ref archive, .. }) if archive == &bad
    ));
    assert!(!dest.join("movie.mkv").exists());
    assert!(!staging.exists());
    assert!(good.exists());
}

#[tokio::test]
async fn split_sevenz_volumes_are_joined_and_unpacked() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("src");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("movie.mkv"), vec![42u8; 4096]).unwrap();
    let whole = dir.path().join("whole.7z");
    sevenz_rust::compress_to_path(&source, &whole).unwrap();

    let bytes = std::fs::read(&whole).unwrap();
    let middle = bytes.len() / 2;
    let first = dir.path().join("movie.7z.001");
    let second = dir.path().join("movie.7z.002");
    std::fs::write(&first, &bytes[..middle]).unwrap();
    std::fs::write(&second, &bytes[middle..]).unwrap();
    let dest = dir.path().join("out");

    // Listed out of order on purpose
    let outputs = ExtractionStage
        .extract(
            &[second, first],
            &dir.path().join("staging"),
            &dest,
            &PasswordList::default(),
        )
        .await
        .unwrap();

    assert_eq!(outputs, vec![dest.join("movie.mkv")]);
    assert_eq!(std::fs::read(&outputs[0]).unwrap(), vec![42u8; 4096]);
}

#[tokio::test]
async fn volumes_without_an_entry_point_pass_through() {
    let dir = TempDir::new().unwrap();
    let orphan = dir.path().join("movie.7z.002");
    std::fs::write(&orphan, b"second half").unwrap();
    let dest = dir.path().join("out");

    let outputs = ExtractionStage
        .extract(
            &[orphan],
            &dir.path().join("staging"),
            &dest,
            &PasswordList::default(),
        )
        .await
        .unwrap();

    assert_eq!(outputs, vec![dest.join("movie.7z.002")]);
}
