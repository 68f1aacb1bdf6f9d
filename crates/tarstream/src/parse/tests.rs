//! Tests for the push parser.

use std::io::Write;

use flate2::{write::GzEncoder, Compression};
use similar_asserts::assert_eq;
use tar_header::Timestamp;

use super::*;

/// Helper to create a tar archive using the tar crate.
fn create_tar_with<F>(f: F) -> Vec<u8>
where
    F: FnOnce(&mut tar::Builder<&mut Vec<u8>>),
{
    let mut data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut data);
        f(&mut builder);
        builder.finish().unwrap();
    }
    data
}

/// Helper to append a file to a tar builder.
fn append_file(builder: &mut tar::Builder<&mut Vec<u8>>, path: &str, content: &[u8]) {
    let mut header = tar::Header::new_ustar();
    header.set_mode(0o644);
    header.set_uid(1000);
    header.set_gid(1000);
    header.set_mtime(1234567890);
    header.set_size(content.len() as u64);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, path, content).unwrap();
}

fn file_header(path: &str, size: u64) -> Header {
    Header {
        path: path.into(),
        mode: Some(0o644),
        size,
        mtime: Some(Timestamp::from_secs(1234567890)),
        entry_type: EntryType::Regular,
        ..Default::default()
    }
}

fn padded(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    out.resize(crate::entry::block_len(data.len() as u64) as usize, 0);
    out
}

/// Feed all of `data` at once and drain every event.
fn parse(data: &[u8], opts: ParseOptions) -> Vec<Event> {
    let mut parser = Parser::new(opts);
    parser.write(data).unwrap();
    parser.end().unwrap();
    std::iter::from_fn(|| parser.next_event()).collect()
}

/// Reduce events to `(path, body)` pairs and warning codes, independent of
/// how the body was chunked.
fn summarize(events: &[Event]) -> (Vec<(String, Vec<u8>)>, Vec<WarningCode>) {
    let mut entries: Vec<(String, Vec<u8>)> = vec![];
    let mut warnings = vec![];
    for event in events {
        match event {
            Event::Entry(entry) => entries.push((entry.path.clone(), vec![])),
            Event::Data(data) => entries.last_mut().unwrap().1.extend_from_slice(data),
            Event::Warning(w) => warnings.push(w.code),
            _ => {}
        }
    }
    (entries, warnings)
}

#[test]
fn test_empty_tar() {
    let events = parse(&[0u8; 1024], ParseOptions::default());
    assert_eq!(events, vec![Event::End]);
}

#[test]
fn test_no_input_is_unrecognized() {
    let events = parse(&[], ParseOptions::default());
    let [Event::Warning(w), Event::End] = &events[..] else {
        panic!("unexpected events: {events:?}");
    };
    assert_eq!(w.code, WarningCode::BadArchive);
    assert_eq!(w.message, "Unrecognized archive format");
}

#[test]
fn test_single_file() {
    let data = create_tar_with(|b| append_file(b, "a.txt", b"hello"));
    let events = parse(&data, ParseOptions::default());

    assert_eq!(events.len(), 4);
    let Event::Entry(entry) = &events[0] else {
        panic!("expected entry, got {:?}", events[0]);
    };
    assert_eq!(entry.path, "a.txt");
    assert_eq!(entry.size, 5);
    assert_eq!(entry.entry_type, EntryType::Regular);
    assert_eq!(entry.mode, Some(0o644));
    assert_eq!(entry.uid, Some(1000));
    assert_eq!(entry.mtime, Some(Timestamp::from_secs(1234567890)));
    assert_eq!(events[1], Event::Data(Bytes::from_static(b"hello")));
    assert_eq!(events[2], Event::EntryEnd);
    assert_eq!(events[3], Event::End);
}

#[test]
fn test_multiple_files_one_byte_at_a_time() {
    let data = create_tar_with(|b| {
        append_file(b, "file1.txt", b"content1");
        append_file(b, "file2.txt", b"content2");
        append_file(b, "empty", b"");
    });

    let mut parser = Parser::default();
    let mut events = vec![];
    for byte in &data {
        parser.write(std::slice::from_ref(byte)).unwrap();
        events.extend(std::iter::from_fn(|| parser.next_event()));
    }
    parser.end().unwrap();
    events.extend(std::iter::from_fn(|| parser.next_event()));

    let (entries, warnings) = summarize(&events);
    assert!(warnings.is_empty());
    assert_eq!(
        entries,
        vec![
            ("file1.txt".to_string(), b"content1".to_vec()),
            ("file2.txt".to_string(), b"content2".to_vec()),
            ("empty".to_string(), vec![]),
        ]
    );
}

#[test]
fn test_directory_symlink_hardlink() {
    let data = create_tar_with(|b| {
        let mut header = tar::Header::new_ustar();
        header.set_mode(0o755);
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        b.append_data(&mut header, "mydir/", std::io::empty())
            .unwrap();

        append_file(b, "mydir/original.txt", b"data");

        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        b.append_link(&mut header, "mydir/sym", "original.txt")
            .unwrap();

        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Link);
        header.set_size(0);
        b.append_link(&mut header, "mydir/hard", "mydir/original.txt")
            .unwrap();
    });

    let entries = list(&data[..], ParseOptions::default()).unwrap();
    let kinds: Vec<_> = entries
        .iter()
        .map(|e| (e.path.as_str(), e.entry_type, e.linkpath.as_str()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("mydir/", EntryType::Directory, ""),
            ("mydir/original.txt", EntryType::Regular, ""),
            ("mydir/sym", EntryType::Symlink, "original.txt"),
            ("mydir/hard", EntryType::Link, "mydir/original.txt"),
        ]
    );
}

#[test]
fn test_gnu_long_name_and_link() {
    let long_path = format!("{}/file.txt", "a".repeat(150));
    let long_target = format!("{}/target", "t".repeat(150));
    let data = create_tar_with(|b| {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(4);
        header.set_entry_type(tar::EntryType::Regular);
        b.append_data(&mut header, &long_path, &b"data"[..])
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        b.append_link(&mut header, "short", &long_target).unwrap();
    });

    let events = parse(&data, ParseOptions::default());
    let metas = events
        .iter()
        .filter(|e| matches!(e, Event::Meta { .. }))
        .count();
    assert_eq!(metas, 2);

    let entries: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Entry(entry) => Some(entry),
            _ => None,
        })
        .collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].path, long_path);
    assert_eq!(entries[1].path, "short");
    assert_eq!(entries[1].linkpath, long_target);
}

#[test]
fn test_pax_long_path() {
    let long_path = format!("{}/{}", "d".repeat(20), "f".repeat(200));
    let mut header = file_header(&long_path, 3);
    let block = header.to_block();
    assert!(header.need_pax);

    let pax = Pax {
        path: Some(long_path.clone()),
        ..Default::default()
    };
    let mut data = pax.encode().unwrap();
    data.extend_from_slice(&block);
    data.extend_from_slice(&padded(b"abc"));
    // a second member must not inherit the extended header
    data.extend_from_slice(&file_header("next", 0).to_block());
    data.extend_from_slice(&[0u8; 1024]);

    let events = parse(&data, ParseOptions::default());
    assert!(matches!(
        events[0],
        Event::Meta {
            entry_type: EntryType::XHeader,
            ..
        }
    ));
    let (entries, warnings) = summarize(&events);
    assert!(warnings.is_empty());
    assert_eq!(
        entries,
        vec![(long_path.clone(), b"abc".to_vec()), ("next".into(), vec![])]
    );

    let Event::Entry(entry) = &events[1] else {
        panic!("expected entry");
    };
    assert_eq!(entry.extended.as_ref().unwrap().path, Some(long_path));
}

#[test]
fn test_global_header_applies_to_all_but_path() {
    let global = Pax {
        global: true,
        path: Some("ignored".into()),
        uid: Some(42),
        ..Default::default()
    };
    let mut data = global.encode().unwrap();
    data.extend_from_slice(&file_header("one", 0).to_block());
    data.extend_from_slice(&file_header("two", 0).to_block());
    data.extend_from_slice(&[0u8; 1024]);

    let entries = list(&data[..], ParseOptions::default()).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].path, "one");
    assert_eq!(entries[0].uid, Some(42));
    assert_eq!(entries[1].path, "two");
    assert_eq!(entries[1].uid, Some(42));
    assert!(entries[1].global_extended.is_some());
}

#[test]
fn test_gzip_autodetect() {
    let data = create_tar_with(|b| append_file(b, "hello.txt", b"hello world"));
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&data).unwrap();
    let compressed = encoder.finish().unwrap();

    // split the magic across writes to exercise deferred detection
    let mut parser = Parser::default();
    parser.write(&compressed[..1]).unwrap();
    assert!(parser.next_event().is_none());
    for chunk in compressed[1..].chunks(100) {
        parser.write(chunk).unwrap();
    }
    parser.end().unwrap();
    let events: Vec<_> = std::iter::from_fn(|| parser.next_event()).collect();

    let (entries, warnings) = summarize(&events);
    assert!(warnings.is_empty());
    assert_eq!(
        entries,
        vec![("hello.txt".to_string(), b"hello world".to_vec())]
    );
}

#[test]
fn test_checksum_failure_warns() {
    let mut data = create_tar_with(|b| {
        append_file(b, "bad.txt", b"");
        append_file(b, "good.txt", b"ok");
    });
    // corrupt the first header's name without fixing the checksum
    data[0] = b'B';

    let events = parse(&data, ParseOptions::default());
    let (entries, warnings) = summarize(&events);
    assert_eq!(warnings, vec![WarningCode::EntryInvalid]);
    assert_eq!(entries, vec![("good.txt".to_string(), b"ok".to_vec())]);
}

#[test]
fn test_strict_turns_warnings_into_errors() {
    let mut data = create_tar_with(|b| append_file(b, "bad.txt", b""));
    data[0] = b'B';

    let mut parser = Parser::new(ParseOptions::strict());
    let err = parser.write(&data).unwrap_err();
    let Error::Warning(w) = err else {
        panic!("expected warning error, got {err:?}");
    };
    assert_eq!(w.code, WarningCode::EntryInvalid);
    assert_eq!(w.message, "checksum failure");
}

#[test]
fn test_linkpath_checks() {
    let mut link = Header {
        path: "link".into(),
        entry_type: EntryType::Symlink,
        ..Default::default()
    };
    let mut file = file_header("file", 0);
    file.linkpath = "nope".into();
    let mut data = link.to_block().to_vec();
    data.extend_from_slice(&file.to_block());
    data.extend_from_slice(&[0u8; 1024]);

    let events = parse(&data, ParseOptions::default());
    let messages: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Warning(w) => Some(w.message.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        messages,
        vec!["linkpath required", "linkpath forbidden"]
    );
}

#[test]
fn test_truncated_body() {
    let mut data = file_header("big", 1000).to_block().to_vec();
    data.extend_from_slice(&[7u8; 600]);

    let events = parse(&data, ParseOptions::default());
    let (entries, _) = summarize(&events);
    assert_eq!(entries[0].1.len(), 600);

    let warning = events
        .iter()
        .find_map(|e| match e {
            Event::Warning(w) => Some(w),
            _ => None,
        })
        .unwrap();
    assert_eq!(warning.code, WarningCode::BadArchive);
    assert_eq!(
        warning.message,
        "Truncated input (needed 424 more bytes, only 0 available)"
    );
    assert_eq!(&events[events.len() - 2..], &[Event::EntryEnd, Event::End]);
}

#[test]
fn test_garbage_is_unrecognized() {
    let events = parse(&[b'x'; 1024], ParseOptions::default());
    let (entries, warnings) = summarize(&events);
    assert!(entries.is_empty());
    assert_eq!(
        warnings,
        vec![
            WarningCode::EntryInvalid,
            WarningCode::EntryInvalid,
            WarningCode::BadArchive
        ]
    );
}

#[test]
fn test_filter_ignores_entries() {
    let data = create_tar_with(|b| {
        append_file(b, "skip.log", b"noise");
        append_file(b, "keep.txt", b"signal");
    });
    let opts = ParseOptions {
        filter: Some(std::sync::Arc::new(|path: &str, _: &ReadEntry| {
            !path.ends_with(".log")
        })),
        ..Default::default()
    };

    let events = parse(&data, opts);
    assert!(matches!(&events[0], Event::Ignored(e) if e.path == "skip.log" && e.is_ignored()));
    let (entries, _) = summarize(&events);
    assert_eq!(entries, vec![("keep.txt".to_string(), b"signal".to_vec())]);
}

#[test]
fn test_unsupported_type_is_ignored() {
    let mut sparse = file_header("sparse", 10);
    sparse.entry_type = EntryType::GnuSparse;
    let mut data = sparse.to_block().to_vec();
    data.extend_from_slice(&padded(&[1u8; 10]));
    data.extend_from_slice(&file_header("after", 1).to_block());
    data.extend_from_slice(&padded(b"z"));
    data.extend_from_slice(&[0u8; 1024]);

    let events = parse(&data, ParseOptions::default());
    assert!(matches!(&events[0], Event::Ignored(e) if e.entry_type == EntryType::GnuSparse));
    let (entries, warnings) = summarize(&events);
    assert!(warnings.is_empty());
    assert_eq!(entries, vec![("after".to_string(), b"z".to_vec())]);
}

#[test]
fn test_oversized_meta_is_ignored() {
    let pax = Pax {
        comment: Some("c".repeat(600)),
        path: Some("from-pax".into()),
        ..Default::default()
    };
    let mut data = pax.encode().unwrap();
    data.extend_from_slice(&file_header("plain", 0).to_block());
    data.extend_from_slice(&[0u8; 1024]);

    let opts = ParseOptions {
        max_meta_entry_size: 512,
        ..Default::default()
    };
    let events = parse(&data, opts);
    assert!(matches!(&events[0], Event::Ignored(e) if e.is_meta()));
    let entries = summarize(&events).0;
    assert_eq!(entries[0].0, "plain");
}

#[test]
fn test_data_after_eof_is_discarded() {
    let mut data = create_tar_with(|b| append_file(b, "a", b"1"));
    data.extend_from_slice(&[0xaa; 4096]);
    let (entries, warnings) = summarize(&parse(&data, ParseOptions::default()));
    assert!(warnings.is_empty());
    assert_eq!(entries.len(), 1);
}

#[test]
fn test_backpressure_and_pause() {
    let data = create_tar_with(|b| append_file(b, "a", b"1"));
    let mut parser = Parser::default();
    assert!(!parser.write(&data[..512]).unwrap());

    parser.pause();
    assert!(parser.next_event().is_none());
    parser.resume();
    assert!(matches!(parser.next_event(), Some(Event::Entry(_))));
    assert!(parser.next_event().is_none());

    assert!(!parser.write(&data[512..1024]).unwrap());
    assert_eq!(parser.next_event(), Some(Event::Data(Bytes::from_static(b"1"))));
    assert_eq!(parser.next_event(), Some(Event::EntryEnd));

    // a null block queues nothing, so the parser asks for more
    assert!(parser.write(&data[1024..1536]).unwrap());
}

#[test]
fn test_abort_is_final() {
    let mut parser = Parser::default();
    let err = parser.abort("stop");
    assert!(matches!(err, Error::Aborted(ref r) if r == "stop"));
    assert!(matches!(parser.write(b"abc"), Err(Error::Aborted(_))));
    assert!(parser.end().is_err());
}

#[test]
fn test_events_iterator() {
    let data = create_tar_with(|b| {
        append_file(b, "x", b"1");
        append_file(b, "y", b"22");
    });
    let events = Events::new(&data[..], ParseOptions::default())
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(events.last(), Some(&Event::End));

    let (entries, warnings) = read_all(&data[..], ParseOptions::default(), true).unwrap();
    assert!(warnings.is_empty());
    assert_eq!(entries[1].0.path, "y");
    assert_eq!(entries[1].1, b"22");
}

#[tokio::test]
async fn test_list_async() {
    let data = create_tar_with(|b| {
        append_file(b, "one", b"1");
        append_file(b, "two", b"2");
    });
    let entries = list_async(&data[..], ParseOptions::default())
        .await
        .unwrap();
    let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["one", "two"]);
}

mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    /// Strategy for generating valid file paths.
    fn path_strategy() -> impl Strategy<Value = String> {
        proptest::string::string_regex("[a-zA-Z0-9_][a-zA-Z0-9_.+-]{0,50}")
            .expect("valid regex")
    }

    /// Strategy for file content.
    fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..2048)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_chunking_does_not_matter(
            files in prop::collection::vec((path_strategy(), content_strategy()), 1..6),
            chunk in 1usize..2000,
        ) {
            let data = create_tar_with(|b| {
                for (path, content) in &files {
                    append_file(b, path, content);
                }
            });

            let mut parser = Parser::default();
            let mut events = vec![];
            for piece in data.chunks(chunk) {
                parser.write(piece).unwrap();
                events.extend(std::iter::from_fn(|| parser.next_event()));
            }
            parser.end().unwrap();
            events.extend(std::iter::from_fn(|| parser.next_event()));

            let (entries, warnings) = summarize(&events);
            prop_assert!(warnings.is_empty());
            prop_assert_eq!(entries, files);
        }
    }
}
