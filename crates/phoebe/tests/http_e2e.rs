//! HTTPS mirror round trips on the shared TLS listener.

mod common;

use common::{http_request, TestServer};

#[test]
fn main_menu_renders_as_html() {
    let server = TestServer::start(|_| {});
    let (head, body) = http_request(
        server.addr,
        "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 200 OK"), "got {head}");
    assert!(head.contains("Content-Type: text/html; charset=UTF-8"));
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("Welcome to Phoebe!"));
    assert!(body.contains("<link rel=\"stylesheet\" href=\"/default.css\"/>"));
}

#[test]
fn page_and_raw_views_mirror_gemini() {
    let server = TestServer::start(|_| {});
    server
        .store()
        .write_page("", "Test", "# Hello\nbody text\n", "0001")
        .unwrap();

    let (head, body) = http_request(
        server.addr,
        "GET /page/Test HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("<h1>Hello</h1>"));

    let (head, body) = http_request(
        server.addr,
        "GET /raw/Test HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(head.contains("Content-Type: text/plain; charset=UTF-8"));
    assert_eq!(String::from_utf8(body).unwrap(), "# Hello\nbody text\n");
}

#[test]
fn head_sends_length_but_no_body() {
    let server = TestServer::start(|_| {});
    let (head, body) = http_request(
        server.addr,
        "HEAD / HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Length: "));
    assert!(body.is_empty());
}

#[test]
fn non_get_methods_are_405() {
    let server = TestServer::start(|_| {});
    let (head, _) = http_request(
        server.addr,
        "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed"), "got {head}");
    assert!(head.contains("Allow: GET, HEAD"));
}

#[test]
fn default_css_is_cacheable() {
    let server = TestServer::start(|_| {});
    let (head, body) = http_request(
        server.addr,
        "GET /default.css HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Type: text/css; charset=UTF-8"));
    assert!(head.contains("Cache-Control: public, max-age=86400, immutable"));
    assert!(String::from_utf8(body).unwrap().contains("html {"));
}

#[test]
fn favicon_is_404_without_an_extension() {
    let server = TestServer::start(|_| {});
    let (head, _) = http_request(
        server.addr,
        "GET /favicon.ico HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 404 Not Found"), "got {head}");
    assert!(head.contains("Cache-Control: public, max-age=86400, immutable"));
}

#[test]
fn missing_page_is_404() {
    let server = TestServer::start(|_| {});
    let (head, _) = http_request(
        server.addr,
        "GET /page/Nope HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 404 Not Found"), "got {head}");
}

#[test]
fn unknown_host_header_is_rejected() {
    let server = TestServer::start(|_| {});
    let (head, _) = http_request(
        server.addr,
        "GET / HTTP/1.1\r\nHost: nowhere.example\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 404 Not Found"), "got {head}");
}

#[test]
fn http10_without_host_uses_the_default_host() {
    let server = TestServer::start(|_| {});
    let (head, _) = http_request(server.addr, "GET / HTTP/1.0\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200 OK"), "got {head}");
}

#[test]
fn files_pass_through_with_their_mime() {
    let server = TestServer::start(|builder| {
        builder.add_mime_type("image/jpeg");
    });
    let bytes = vec![0xff, 0xd8, 0xff, 0xe0];
    server
        .store()
        .write_file("", "photo.jpg", &bytes, "image/jpeg", "0001")
        .unwrap();
    let (head, body) = http_request(
        server.addr,
        "GET /file/photo.jpg HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(head.contains("Content-Type: image/jpeg"));
    assert_eq!(body, bytes);
}

#[test]
fn new_page_prompt_has_no_http_mirror() {
    let server = TestServer::start(|_| {});
    let (head, _) = http_request(
        server.addr,
        "GET /do/new HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 404 Not Found"), "got {head}");
}
