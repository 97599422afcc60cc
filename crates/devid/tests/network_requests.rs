//! Integration tests for `XMLHttpRequest` against a local HTTP peer.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use devid::{Error, NetworkConfig, Sandbox, SandboxBuilder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

type Responder = fn(&str) -> (&'static str, String);

/// Serve every connection with `respond(request_head)` until the test ends.
async fn serve(respond: Responder) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle(stream, respond));
        }
    });
    addr
}

async fn handle(mut stream: TcpStream, respond: Responder) {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 1024];
    let head_end = loop {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let body_len = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + body_len {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let (content_type, body) = respond(&head);
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn builder() -> SandboxBuilder {
    Sandbox::builder()
        .with_poll_interval(Duration::from_millis(10))
        .with_timeout(Duration::from_secs(5))
}

fn request_script(url: &str, response_type: &str, on_load: &str) -> String {
    format!(
        r"
        var id = '';
        var log = [];
        var xhr = new XMLHttpRequest();
        xhr.open('POST', '{url}');
        xhr.setRequestHeader('Content-Type', 'application/json');
        xhr.setRequestHeader('X-Sm-Test', 'no');
        xhr.setRequestHeader('x-sm-test', 'yes');
        xhr.responseType = '{response_type}';
        xhr.onreadystatechange = function () {{ log.push('rs' + xhr.readyState); }};
        xhr.onload = function () {{ {on_load} }};
        xhr.onerror = function () {{ log.push('error' + xhr.status); id = log.join(','); }};
        xhr.send(JSON.stringify({{ organization: _smConf.organization }}));
        var SMSdk = {{ getDeviceId: function () {{ return id; }} }};
        "
    )
}

#[tokio::test]
async fn test_json_response_is_parsed() {
    let addr = serve(|_| {
        (
            "application/json",
            r#"{"code":1100,"detail":{"deviceId":"Bnet"}}"#.to_string(),
        )
    })
    .await;
    let script = request_script(
        &format!("http://{addr}/deviceprofile/v4"),
        "json",
        "id = xhr.status + ':' + xhr.response.detail.deviceId + ':' + xhr.getResponseHeader('Content-Type');",
    );

    let id = builder().build().run_source(&script).await.unwrap();
    assert_eq!(id, "200:Bnet:application/json");
}

#[tokio::test]
async fn test_malformed_json_yields_null() {
    let addr = serve(|_| ("text/plain", "not json".to_string())).await;
    let script = request_script(
        &format!("http://{addr}/"),
        "json",
        "id = String(xhr.response) + '|' + xhr.responseText;",
    );

    let id = builder().build().run_source(&script).await.unwrap();
    assert_eq!(id, "null|not json");
}

#[tokio::test]
async fn test_request_reaches_peer() {
    let addr = serve(|head| {
        let lower = head.to_ascii_lowercase();
        let first_line = head.lines().next().unwrap_or_default().to_string();
        (
            "text/plain",
            format!(
                "{first_line}|{}|{}",
                lower.contains("x-sm-test: yes"),
                lower.contains("x-sm-test: no"),
            ),
        )
    })
    .await;
    let script = request_script(
        &format!("http://{addr}/echo?x=1"),
        "",
        "id = xhr.responseText;",
    );

    let id = builder().build().run_source(&script).await.unwrap();
    assert_eq!(id, "POST /echo?x=1 HTTP/1.1|true|false");
}

#[tokio::test]
async fn test_transport_failure_fires_error_handlers() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let script = request_script(&format!("http://{addr}/"), "json", "id = 'unexpected load';");

    let id = builder().build().run_source(&script).await.unwrap();
    assert_eq!(id, "rs4,error0");
}

#[tokio::test]
async fn test_disallowed_host_fails_as_transport_error() {
    let addr = serve(|_| ("text/plain", "should not be fetched".to_string())).await;
    let script = request_script(&format!("http://{addr}/"), "", "id = 'unexpected load';");

    let id = builder()
        .with_network(
            NetworkConfig::builder()
                .allowed_hosts(vec!["*.portal101.cn"])
                .build(),
        )
        .build()
        .run_source(&script)
        .await
        .unwrap();
    assert_eq!(id, "rs4,error0");
}

#[tokio::test]
async fn test_unsupported_scheme_fails_as_transport_error() {
    let script = request_script("ftp://example.com/file", "", "id = 'unexpected load';");
    let id = builder().build().run_source(&script).await.unwrap();
    assert_eq!(id, "rs4,error0");
}

#[tokio::test]
async fn test_response_type_set_after_send() {
    let addr = serve(|_| ("application/json", r#"{"a":1}"#.to_string())).await;
    let script = format!(
        r"
        var id = '';
        var xhr = new XMLHttpRequest();
        xhr.open('GET', 'http://{addr}/');
        xhr.onload = function () {{ id = 'resp=' + JSON.stringify(xhr.response); }};
        xhr.send();
        xhr.responseType = 'json';
        var SMSdk = {{ getDeviceId: function () {{ return id; }} }};
        "
    );

    let id = builder().build().run_source(&script).await.unwrap();
    assert_eq!(id, r#"resp={"a":1}"#);
}

#[tokio::test]
async fn test_readystatechange_precedes_load() {
    let addr = serve(|_| ("text/plain", "ok".to_string())).await;
    let script = request_script(
        &format!("http://{addr}/"),
        "",
        "log.push('load' + xhr.status); id = log.join(',');",
    );

    let id = builder().build().run_source(&script).await.unwrap();
    assert_eq!(id, "rs4,load200");
}

#[tokio::test]
async fn test_load_handler_exception_is_fatal() {
    let addr = serve(|_| ("text/plain", "ok".to_string())).await;
    let script = request_script(
        &format!("http://{addr}/"),
        "",
        "throw new Error('load handler exploded');",
    );

    let err = builder().build().run_source(&script).await.unwrap_err();
    match &err {
        Error::Fatal { message, .. } => {
            assert!(message.contains("load handler exploded"), "{message}");
        }
        other => panic!("expected fatal failure, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn test_error_handler_exception_is_fatal() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let script = format!(
        r"
        var xhr = new XMLHttpRequest();
        xhr.open('GET', 'http://{addr}/');
        xhr.onerror = function () {{ throw new Error('error handler exploded'); }};
        xhr.send();
        var SMSdk = {{ getDeviceId: function () {{ return ''; }} }};
        "
    );

    let err = builder().build().run_source(&script).await.unwrap_err();
    assert!(
        matches!(&err, Error::Fatal { message, .. } if message.contains("error handler exploded")),
        "{err:?}"
    );
}
