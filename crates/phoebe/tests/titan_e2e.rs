//! Titan upload round trips: framing, validation, and store effects.

mod common;

use std::thread;

use common::{gemini_query, titan_put, TestServer};

#[test]
fn page_write_then_read_back() {
    let server = TestServer::start(|_| {});
    let body = b"Welcome to the wiki!\nPlease be kind.";
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/raw/Welcome;mime=text/plain;size=36;token=hello",
        body,
    );
    assert_eq!(header, "30 gemini://localhost:1965/page/Welcome");

    let (header, read_back) = gemini_query(server.addr, "gemini://localhost/raw/Welcome");
    assert_eq!(header, "20 text/plain; charset=UTF-8");
    assert_eq!(read_back, body);

    let (header, page) = gemini_query(server.addr, "gemini://localhost/page/Welcome");
    assert_eq!(header, "20 text/gemini; charset=UTF-8");
    assert!(String::from_utf8(page).unwrap().starts_with("Welcome to the wiki!\n"));
}

#[test]
fn wrong_token_is_59_and_store_unchanged() {
    let server = TestServer::start(|_| {});
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/raw/Welcome;mime=text/plain;size=4;token=wrong",
        b"text",
    );
    assert_eq!(header, "59 Your token is the wrong token");

    let (header, _) = gemini_query(server.addr, "gemini://localhost/page/Welcome");
    assert!(header.starts_with("51 "), "got {header}");
    assert!(server.store().read_changes("", 10, 0).unwrap().is_empty());
}

#[test]
fn missing_size_is_59() {
    let server = TestServer::start(|_| {});
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/raw/Welcome;mime=text/plain;token=hello",
        b"",
    );
    assert!(header.starts_with("59 "), "got {header}");
}

#[test]
fn space_token_authorizes_its_space() {
    let server = TestServer::start(|builder| {
        builder.add_space_spec("alpha");
        builder
            .set_file(toml::from_str("[space.alpha]\ntokens = [\"sesame\"]\n").expect("toml"));
    });
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/alpha/raw/Secret;mime=text/plain;size=2;token=sesame",
        b"hi",
    );
    assert_eq!(header, "30 gemini://localhost:1965/alpha/page/Secret");
    // The space token does not open the root space.
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/raw/Secret;mime=text/plain;size=2;token=sesame",
        b"hi",
    );
    assert_eq!(header, "59 Your token is the wrong token");
}

#[test]
fn file_upload_respects_the_mime_allow_list() {
    let server = TestServer::start(|builder| {
        builder.add_mime_type("image/jpeg");
    });
    // 40 KB payload, larger than the page size limit on purpose.
    let payload = vec![0x5a_u8; 40 * 1024];
    let line = format!(
        "titan://localhost/file/jupiter.jpg;mime=image/jpeg;size={};token=hello",
        payload.len()
    );
    let (header, _) = titan_put(server.addr, &line, &payload);
    assert_eq!(header, "30 gemini://localhost:1965/file/jupiter.jpg");

    let (header, bytes) = gemini_query(server.addr, "gemini://localhost/file/jupiter.jpg");
    assert_eq!(header, "20 image/jpeg");
    assert_eq!(bytes, payload);

    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/file/jupiter.png;mime=image/png;size=4;token=hello",
        b"\x89PNG",
    );
    assert_eq!(header, "59 This wiki does not allow image/png");
}

#[test]
fn bare_major_type_allows_all_subtypes() {
    let server = TestServer::start(|builder| {
        builder.add_mime_type("image");
    });
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/file/vector.svg;mime=image/svg+xml;size=5;token=hello",
        b"<svg>",
    );
    assert_eq!(header, "30 gemini://localhost:1965/file/vector.svg");
}

#[test]
fn page_size_limit_is_a_hard_boundary() {
    let server = TestServer::start(|builder| {
        builder.page_size_limit(16);
    });
    let exact = vec![b'x'; 16];
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/raw/Limit;mime=text/plain;size=16;token=hello",
        &exact,
    );
    assert_eq!(header, "30 gemini://localhost:1965/page/Limit");

    let over = vec![b'x'; 17];
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/raw/Limit;mime=text/plain;size=17;token=hello",
        &over,
    );
    assert_eq!(header, "59 This wiki does not allow more than 16 bytes per page");
    // The stored page still holds the accepted revision.
    assert_eq!(server.store().read_page("", "Limit").unwrap().revision, 1);
}

#[test]
fn pages_reject_non_text_mime() {
    let server = TestServer::start(|builder| {
        builder.add_mime_type("image/jpeg");
    });
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/raw/Pic;mime=image/jpeg;size=3;token=hello",
        b"abc",
    );
    assert_eq!(header, "59 This wiki does not allow image/jpeg");
}

#[test]
fn only_declared_bytes_are_consumed() {
    let server = TestServer::start(|_| {});
    let mut payload = b"exact".to_vec();
    payload.extend_from_slice(b"TRAILING GARBAGE");
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/raw/Exact;mime=text/plain;size=5;token=hello",
        &payload,
    );
    assert_eq!(header, "30 gemini://localhost:1965/page/Exact");
    assert_eq!(server.store().read_page("", "Exact").unwrap().text, "exact");
}

#[test]
fn empty_body_deletes_the_page() {
    let server = TestServer::start(|_| {});
    titan_put(
        server.addr,
        "titan://localhost/raw/Gone;mime=text/plain;size=7;token=hello",
        b"content",
    );
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/raw/Gone;mime=text/plain;size=0;token=hello",
        b"",
    );
    assert!(header.starts_with("30 "), "got {header}");

    let (header, _) = gemini_query(server.addr, "gemini://localhost/page/Gone");
    assert!(header.starts_with("51 "), "got {header}");

    // History still lists the prior revision.
    let (header, body) = gemini_query(server.addr, "gemini://localhost/history/Gone");
    assert_eq!(header, "20 text/gemini; charset=UTF-8");
    assert!(String::from_utf8(body).unwrap().contains("Revision 1"));
}

#[test]
fn parallel_writes_produce_ordered_revisions() {
    let server = TestServer::start(|_| {});
    let addr = server.addr;
    let writers: Vec<_> = [&b"A"[..], &b"B"[..]]
        .into_iter()
        .map(|body| {
            thread::spawn(move || {
                titan_put(
                    addr,
                    "titan://localhost/raw/X;mime=text/plain;size=1;token=hello",
                    body,
                )
            })
        })
        .collect();
    for writer in writers {
        let (header, _) = writer.join().unwrap();
        assert!(header.starts_with("30 "), "got {header}");
    }

    let one = server.store().read_page_revision("", "X", 1).unwrap();
    let two = server.store().read_page_revision("", "X", 2).unwrap();
    assert_ne!(one, two);
    assert!(matches!(one.as_str(), "A" | "B"));
    assert!(matches!(two.as_str(), "A" | "B"));

    let (_, body) = gemini_query(addr, "gemini://localhost/history/X");
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("Revision 1"));

    let (_, body) = gemini_query(addr, "gemini://localhost/diff/X/2");
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("< "));
    assert!(body.contains("---"));
    assert!(body.contains("> "));
}

#[test]
fn whitelisted_client_certificate_writes_without_a_token() {
    let fingerprint = common::client_cert_fingerprint();
    let server = TestServer::start(move |builder| {
        builder.enable_extension("cert-whitelist");
        let doc = format!("[cert-whitelist]\nfingerprints = [\"{fingerprint}\"]\n");
        builder.set_file(toml::from_str(&doc).expect("toml"));
    });

    let raw = common::raw_request_with_client_cert(
        server.addr,
        "localhost",
        b"titan://localhost/raw/Signed;mime=text/plain;size=6;token=\r\nsigned",
    );
    let header = String::from_utf8_lossy(&raw);
    assert!(
        header.starts_with("30 gemini://localhost:1965/page/Signed"),
        "got {header}"
    );
    assert_eq!(server.store().read_page("", "Signed").unwrap().text, "signed");
}

#[test]
fn certificate_statuses_guide_certless_and_unlisted_clients() {
    let server = TestServer::start(|builder| {
        builder.enable_extension("cert-whitelist");
        builder.set_file(
            toml::from_str("[cert-whitelist]\nfingerprints = [\"sha256:0000\"]\n")
                .expect("toml"),
        );
    });

    // No certificate, no token: the server asks for a certificate.
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/raw/Signed;mime=text/plain;size=1;token=",
        b"x",
    );
    assert!(header.starts_with("60 "), "got {header}");

    // A certificate outside the whitelist is not authorized.
    let raw = common::raw_request_with_client_cert(
        server.addr,
        "localhost",
        b"titan://localhost/raw/Signed;mime=text/plain;size=1;token=\r\nx",
    );
    let header = String::from_utf8_lossy(&raw);
    assert!(header.starts_with("61 "), "got {header}");

    // The default token still works for ordinary clients.
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/raw/Signed;mime=text/plain;size=1;token=hello",
        b"x",
    );
    assert!(header.starts_with("30 "), "got {header}");
}

#[test]
fn writes_to_unwritable_paths_are_59() {
    let server = TestServer::start(|_| {});
    let (header, _) = titan_put(
        server.addr,
        "titan://localhost/do/index;mime=text/plain;size=1;token=hello",
        b"x",
    );
    assert!(header.starts_with("59 "), "got {header}");
}
