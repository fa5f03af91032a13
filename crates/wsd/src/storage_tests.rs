// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn file_uri(path: &Path) -> Url {
    Url::from_file_path(path).unwrap()
}

#[test]
fn sanitize_accepts_encoded_file_uri() {
    let uri = sanitize_uri("file%3A%2F%2F%2Ftmp%2Fhello%20world.odt").unwrap();
    assert_eq!(uri.scheme(), "file");
    assert_eq!(uri.to_file_path().unwrap(), PathBuf::from("/tmp/hello world.odt"));
}

#[test]
fn sanitize_accepts_bare_absolute_path() {
    let uri = sanitize_uri("/tmp/report.ods").unwrap();
    assert_eq!(uri.scheme(), "file");
}

#[test]
fn sanitize_rejects_junk() {
    assert!(sanitize_uri("").is_err());
    assert!(sanitize_uri("not a uri").is_err());
    assert!(sanitize_uri("http://host").is_err());
}

#[test]
fn doc_key_includes_host_and_is_stable() {
    let one = doc_key(&Url::parse("http://alpha/docs/d.odt").unwrap());
    let two = doc_key(&Url::parse("http://beta/docs/d.odt").unwrap());
    assert_ne!(one, two);
    assert_eq!(one, doc_key(&Url::parse("http://alpha/docs/d.odt").unwrap()));
    // Url-encoded: no raw separators survive.
    assert!(!one.contains('/'));
}

#[test]
fn local_roundtrip_through_jail() {
    let origin = tempfile::tempdir().unwrap();
    let jail = tempfile::tempdir().unwrap();
    let doc = origin.path().join("memo.odt");
    std::fs::write(&doc, b"v1").unwrap();

    let storage = create_jailed(&file_uri(&doc), jail.path()).unwrap();
    let info = storage.file_info().unwrap();
    assert_eq!(info.filename, "memo.odt");
    assert_eq!(info.size, 2);

    let chroot_path = storage.load_to_jail().unwrap();
    assert_eq!(chroot_path, Path::new("/").join(JAILED_DOCUMENT_ROOT).join("memo.odt"));

    let jailed = jail.path().join(JAILED_DOCUMENT_ROOT).join("memo.odt");
    assert_eq!(std::fs::read(&jailed).unwrap(), b"v1");

    // Worker edits the jailed copy; save copies it back.
    std::fs::write(&jailed, b"v2 edited").unwrap();
    storage.save_from_jail().unwrap();
    assert_eq!(std::fs::read(&doc).unwrap(), b"v2 edited");
}

#[test]
fn probe_storage_rejects_missing_file() {
    let storage = create(&Url::parse("file:///nonexistent/nowhere.odt").unwrap()).unwrap();
    assert!(storage.file_info().is_err());
}

#[test]
fn remote_scheme_has_no_backend() {
    assert!(create(&Url::parse("http://example.com/doc.odt").unwrap()).is_err());
}

#[test]
fn save_before_load_is_an_error() {
    let origin = tempfile::tempdir().unwrap();
    let doc = origin.path().join("d.odt");
    std::fs::write(&doc, b"x").unwrap();
    let storage = create_jailed(&file_uri(&doc), origin.path()).unwrap();
    assert!(storage.save_from_jail().is_err());
}
