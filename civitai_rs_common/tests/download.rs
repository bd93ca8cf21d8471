use std::{
    fs,
    io::{BufRead, BufReader, Write},
    net::{SocketAddr, TcpListener},
    path::Path,
    thread::{self, JoinHandle},
};

use civitai_rs_common::{fetch, DownloadRequest, Downloader, BROWSER_USER_AGENT};

struct Served {
    addr: SocketAddr,
    /// Request head (request line and headers) as received.
    handle: JoinHandle<Vec<String>>,
}

/// Answer exactly one HTTP request with `status`, optionally declaring the content length,
/// and write `body` in `chunk`-sized pieces.
fn serve_once(status: &'static str, body: Vec<u8>, declare_length: bool, chunk: usize) -> Served {
    let content_length = declare_length.then_some(body.len());
    serve(status, body, content_length, chunk)
}

/// Like [`serve_once`], but announces `content_length` regardless of how much is sent.
fn serve(
    status: &'static str,
    body: Vec<u8>,
    content_length: Option<usize>,
    chunk: usize,
) -> Served {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut head = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                break;
            }
            head.push(line.trim_end().to_string());
        }

        let mut stream = stream;
        let mut response = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
        if let Some(len) = content_length {
            response.push_str(&format!("Content-Length: {len}\r\n"));
        }
        response.push_str("\r\n");
        stream.write_all(response.as_bytes()).unwrap();
        for piece in body.chunks(chunk.max(1)) {
            stream.write_all(piece).unwrap();
            stream.flush().unwrap();
        }
        head
    });
    Served { addr, handle }
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn header<'a>(head: &'a [String], name: &str) -> Option<&'a str> {
    head.iter().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir).unwrap().next().is_none()
}

#[test]
fn writes_exactly_the_served_bytes() {
    let expected = body(100_003);
    let served = serve_once("200 OK", expected.clone(), true, 4096);
    let out = tempfile::tempdir().unwrap();
    let url = format!("http://{}/api/download/models/1199750?type=Model", served.addr);

    let downloader = Downloader::new(true).unwrap();
    let path = downloader
        .fetch(&DownloadRequest::new(&url, "secret-token", out.path()))
        .expect("download should succeed");

    assert_eq!(path, out.path().join("civitai_model_1199750.safetensors"));
    assert_eq!(fs::read(&path).unwrap(), expected);
    assert!(!out
        .path()
        .join("civitai_model_1199750.safetensors.part")
        .exists());

    let head = served.handle.join().unwrap();
    assert!(head[0].starts_with("GET /api/download/models/1199750?type=Model "));
    assert_eq!(header(&head, "authorization"), Some("Bearer secret-token"));
    assert_eq!(header(&head, "user-agent"), Some(BROWSER_USER_AGENT));
}

#[test]
fn handles_bodies_without_content_length() {
    let expected = body(20_000);
    let served = serve_once("200 OK", expected.clone(), false, 777);
    let out = tempfile::tempdir().unwrap();
    let url = format!("http://{}/api/download/models/42", served.addr);

    let path = Downloader::new(true)
        .unwrap()
        .with_chunk_size(1000)
        .try_fetch(&DownloadRequest::new(&url, "t", out.path()))
        .unwrap();

    assert_eq!(fs::read(&path).unwrap().len(), expected.len());
    served.handle.join().unwrap();
}

#[test]
fn creates_missing_output_directory() {
    let served = serve_once("200 OK", body(10), true, 10);
    let out = tempfile::tempdir().unwrap();
    let nested = out.path().join("a").join("b");
    let url = format!("http://{}/api/download/models/5", served.addr);

    let path = fetch(&url, "t", &nested).expect("download should succeed");

    assert_eq!(path, nested.join("civitai_model_5.safetensors"));
    assert_eq!(fs::read(path).unwrap().len(), 10);
    served.handle.join().unwrap();
}

#[test]
fn http_error_status_yields_nothing() {
    let served = serve_once("404 Not Found", b"missing".to_vec(), true, 64);
    let out = tempfile::tempdir().unwrap();
    let url = format!("http://{}/api/download/models/9", served.addr);

    let result = Downloader::new(true)
        .unwrap()
        .fetch(&DownloadRequest::new(&url, "t", out.path()));

    assert!(result.is_none());
    assert!(dir_is_empty(out.path()));
    served.handle.join().unwrap();
}

#[test]
fn truncated_body_leaves_no_partial_file() {
    let served = serve("200 OK", body(30_000), Some(100_000), 4096);
    let out = tempfile::tempdir().unwrap();
    let url = format!("http://{}/api/download/models/1199750", served.addr);

    let result = Downloader::new(true)
        .unwrap()
        .fetch(&DownloadRequest::new(&url, "t", out.path()));

    assert!(result.is_none());
    assert!(dir_is_empty(out.path()));
    served.handle.join().unwrap();
}

#[test]
fn connection_failure_yields_nothing() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let out = tempfile::tempdir().unwrap();
    let url = format!("http://{addr}/api/download/models/9");

    let result = Downloader::new(true)
        .unwrap()
        .fetch(&DownloadRequest::new(&url, "t", out.path()));

    assert!(result.is_none());
    assert!(dir_is_empty(out.path()));
}

#[test]
fn url_without_model_id_is_rejected_before_any_request() {
    let out = tempfile::tempdir().unwrap();
    let result = Downloader::new(true).unwrap().fetch(&DownloadRequest::new(
        "http://127.0.0.1:9/api/download/",
        "t",
        out.path().join("never"),
    ));

    assert!(result.is_none());
    assert!(!out.path().join("never").exists());
}
