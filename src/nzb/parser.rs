//! Streaming NZB parser

use super::{NzbFile, NzbMeta, NzbPlan, Segment, classify, filename_from_subject};
use crate::error::NzbError;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

#[derive(Debug)]
enum State {
    Outside,
    InNzb,
    InHead,
    InMeta(String),
    InFile,
    InGroups,
    InGroup,
    InSegments,
    InSegment { bytes: u64, number: Option<u32> },
}

struct FileBuilder {
    subject: String,
    poster: String,
    date: i64,
    groups: Vec<String>,
    segments: Vec<(u32, u64, String)>,
}

/// Parse an NZB document into a segment plan
///
/// Files without segments are skipped. Segment order is kept exactly as written;
/// the `number` attribute is recorded but never used to reorder.
pub fn parse(document: &[u8]) -> Result<NzbPlan, NzbError> {
    let mut reader = Reader::from_reader(document);
    reader.config_mut().trim_text(true);

    let mut parser = Parser {
        state: State::Outside,
        meta: NzbMeta::default(),
        files: Vec::new(),
        current: None,
        text: String::new(),
        skipped: 0,
    };

    let mut buf = Vec::with_capacity(4096);
    let mut saw_root = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if e.local_name().as_ref() == b"nzb" {
                    saw_root = true;
                }
                parser.start(e)?;
            }
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"nzb" {
                    saw_root = true;
                }
                parser.start(e)?;
                parser.end(e.local_name().as_ref())?;
            }
            Ok(Event::End(ref e)) => parser.end(e.local_name().as_ref())?,
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|e| NzbError::Xml(e.to_string()))?;
                parser.text.push_str(&text);
            }
            Ok(Event::CData(ref e)) => {
                parser.text.push_str(&String::from_utf8_lossy(e));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(NzbError::Xml(e.to_string())),
        }
        buf.clear();
    }

    if !saw_root {
        return Err(NzbError::Xml("missing <nzb> root element".to_string()));
    }
    if parser.skipped > 0 {
        tracing::warn!(
            skipped = parser.skipped,
            "Skipped NZB files without segments"
        );
    }
    if parser.files.is_empty() {
        return Err(NzbError::NoFiles);
    }

    Ok(NzbPlan {
        meta: parser.meta,
        files: parser.files,
    })
}

struct Parser {
    state: State,
    meta: NzbMeta,
    files: Vec<NzbFile>,
    current: Option<FileBuilder>,
    text: String,
    skipped: usize,
}

impl Parser {
    fn start(&mut self, e: &BytesStart) -> Result<(), NzbError> {
        self.text.clear();
        let next = match (&self.state, e.local_name().as_ref()) {
            (State::Outside, b"nzb") => State::InNzb,
            (State::InNzb, b"head") => State::InHead,
            (State::InHead, b"meta") => State::InMeta(attr(e, b"type")?.unwrap_or_default()),
            (State::InNzb, b"file") => {
                self.current = Some(FileBuilder {
                    subject: attr(e, b"subject")?.unwrap_or_default(),
                    poster: attr(e, b"poster")?.unwrap_or_default(),
                    date: attr(e, b"date")?
                        .and_then(|d| d.trim().parse().ok())
                        .unwrap_or(0),
                    groups: Vec::new(),
                    segments: Vec::new(),
                });
                State::InFile
            }
            (State::InFile, b"groups") => State::InGroups,
            (State::InGroups, b"group") => State::InGroup,
            (State::InFile, b"segments") => State::InSegments,
            (State::InSegments, b"segment") => {
                let bytes = attr(e, b"bytes")?
                    .ok_or(NzbError::InvalidAttribute {
                        element: "segment",
                        attribute: "bytes",
                        reason: "missing".to_string(),
                    })?
                    .trim()
                    .parse::<u64>()
                    .map_err(|err| NzbError::InvalidAttribute {
                        element: "segment",
                        attribute: "bytes",
                        reason: err.to_string(),
                    })?;
                let number = attr(e, b"number")?.and_then(|n| n.trim().parse().ok());
                State::InSegment { bytes, number }
            }
            _ => return Ok(()),
        };
        self.state = next;
        Ok(())
    }

    fn end(&mut self, tag: &[u8]) -> Result<(), NzbError> {
        let next = match (&self.state, tag) {
            (State::InMeta(kind), b"meta") => {
                let value = std::mem::take(&mut self.text);
                match kind.as_str() {
                    "title" => self.meta.title = Some(value),
                    "password" => self.meta.password = Some(value),
                    "category" => self.meta.category = Some(value),
                    _ => {}
                }
                State::InHead
            }
            (State::InHead, b"head") => State::InNzb,
            (State::InGroup, b"group") => {
                let group = std::mem::take(&mut self.text);
                if let Some(file) = self.current.as_mut() {
                    file.groups.push(group);
                }
                State::InGroups
            }
            (State::InGroups, b"groups") => State::InFile,
            (State::InSegment { bytes, number }, b"segment") => {
                let (bytes, number) = (*bytes, *number);
                let message_id = std::mem::take(&mut self.text);
                let message_id = message_id
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string();
                if let Some(file) = self.current.as_mut() {
                    if message_id.is_empty() {
                        return Err(NzbError::EmptyMessageId {
                            file_index: self.files.len(),
                            segment_index: file.segments.len(),
                        });
                    }
                    let number = number.unwrap_or(file.segments.len() as u32 + 1);
                    file.segments.push((number, bytes, message_id));
                }
                State::InSegments
            }
            (State::InSegments, b"segments") => State::InFile,
            (State::InFile, b"file") => {
                if let Some(builder) = self.current.take() {
                    self.finish_file(builder);
                }
                State::InNzb
            }
            (State::InNzb, b"nzb") => State::Outside,
            _ => return Ok(()),
        };
        self.state = next;
        Ok(())
    }

    fn finish_file(&mut self, builder: FileBuilder) {
        if builder.segments.is_empty() {
            tracing::warn!(subject = %builder.subject, "NZB file has no segments, skipping");
            self.skipped += 1;
            return;
        }

        let index = self.files.len();
        let filename = filename_from_subject(&builder.subject, index);
        let kind = classify(&filename);
        let segments = builder
            .segments
            .into_iter()
            .enumerate()
            .map(|(segment_index, (number, bytes, message_id))| Segment {
                file_index: index,
                segment_index,
                number,
                message_id,
                bytes,
            })
            .collect();

        self.files.push(NzbFile {
            index,
            subject: builder.subject,
            poster: builder.poster,
            date: builder.date,
            groups: builder.groups,
            filename,
            kind,
            segments,
        });
    }
}

fn attr(e: &BytesStart, name: &[u8]) -> Result<Option<String>, NzbError> {
    for attribute in e.attributes().flatten() {
        if attribute.key.local_name().as_ref() == name {
            return attribute
                .unescape_value()
                .map(|v| Some(v.into_owned()))
                .map_err(|err| NzbError::Xml(err.to_string()));
        }
    }
    Ok(None)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::nzb::FileKind;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nzb PUBLIC "-//newzbin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <head>
    <meta type="title">Some.Movie.2024</meta>
    <meta type="password">hunter2</meta>
  </head>
  <file poster="poster@example.com" date="1706140800" subject='Some.Movie [1/3] - "some.movie.mkv" yEnc (1/3)'>
    <groups><group>alt.binaries.movies</group></groups>
    <segments>
      <segment bytes="300" number="3">c@example</segment>
      <segment bytes="500" number="1">a@example</segment>
      <segment bytes="400" number="2">b@example</segment>
    </segments>
  </file>
  <file poster="poster@example.com" date="1706140800" subject='Some.Movie [2/3] - "some.movie.par2" yEnc (1/1)'>
    <groups><group>alt.binaries.movies</group></groups>
    <segments>
      <segment bytes="40" number="1">&lt;par@example&gt;</segment>
    </segments>
  </file>
  <file poster="poster@example.com" date="1706140800" subject='Some.Movie [3/3] - "some.movie.nfo" yEnc (0/0)'>
    <groups><group>alt.binaries.movies</group></groups>
    <segments/>
  </file>
</nzb>
"#;

    #[test]
    fn preserves_authored_segment_order() {
        let plan = parse(SAMPLE.as_bytes()).unwrap();
        let ids: Vec<_> = plan.files[0]
            .segments
            .iter()
            .map(|s| s.message_id.as_str())
            .collect();
        assert_eq!(ids, ["c@example", "a@example", "b@example"]);
        let numbers: Vec<_> = plan.files[0].segments.iter().map(|s| s.number).collect();
        assert_eq!(numbers, [3, 1, 2]);
        let indexes: Vec<_> = plan.files[0]
            .segments
            .iter()
            .map(|s| s.segment_index)
            .collect();
        assert_eq!(indexes, [0, 1, 2]);
    }

    #[test]
    fn skips_files_without_segments() {
        let plan = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(plan.files.len(), 2);
        assert!(plan.files.iter().all(|f| !f.filename.ends_with(".nfo")));
    }

    #[test]
    fn classifies_payload_and_repair_files() {
        let plan = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(plan.files[0].kind, FileKind::Media);
        assert_eq!(plan.files[1].kind, FileKind::ParIndex);
        assert!(plan.has_repair_data());
    }

    #[test]
    fn reads_head_metadata() {
        let plan = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(plan.meta.title.as_deref(), Some("Some.Movie.2024"));
        assert_eq!(plan.meta.password.as_deref(), Some("hunter2"));
        assert_eq!(plan.display_name().as_deref(), Some("Some.Movie.2024"));
    }

    #[test]
    fn strips_angle_brackets_from_message_ids() {
        let plan = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(plan.files[1].segments[0].message_id, "par@example");
        assert_eq!(plan.files[1].segments[0].file_index, 1);
    }

    #[test]
    fn totals_follow_declared_sizes() {
        let plan = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(plan.files[0].declared_size(), 1200);
        assert_eq!(plan.total_bytes(), 1240);
        assert_eq!(plan.segment_count(), 4);
    }

    #[test]
    fn document_without_files_is_rejected() {
        let doc = r#"<nzb><head><meta type="title">x</meta></head></nzb>"#;
        assert_eq!(parse(doc.as_bytes()), Err(NzbError::NoFiles));
    }

    #[test]
    fn missing_root_is_rejected() {
        assert!(matches!(parse(b"<html></html>"), Err(NzbError::Xml(_))));
    }

    #[test]
    fn segment_without_bytes_is_rejected() {
        let doc = r#"<nzb><file subject="a"><segments><segment number="1">x@y</segment></segments></file></nzb>"#;
        assert!(matches!(
            parse(doc.as_bytes()),
            Err(NzbError::InvalidAttribute {
                attribute: "bytes",
                ..
            })
        ));
    }

    #[test]
    fn empty_message_id_is_rejected() {
        let doc = r#"<nzb><file subject="a"><segments><segment bytes="1" number="1"> </segment></segments></file></nzb>"#;
        assert!(matches!(
            parse(doc.as_bytes()),
            Err(NzbError::EmptyMessageId { .. })
        ));
    }

    #[test]
    fn malformed_xml_is_an_error() {
        let doc = r#"<nzb><file subject="a"><segments><segment bytes="1">x@y</segments></nzb>"#;
        assert!(parse(doc.as_bytes()).is_err());
    }
}
