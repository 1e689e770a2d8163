mod common;

use async_trait::async_trait;
use carecrawl::executor::{Exchange, Rejection};
use carecrawl::{CaptchaError, ErrorKind, RequestError};
use carecrawl_config::{
    HttpClientParams, HttpRequest, HttpResponse, HttpTransport, ProxyConfig, ReqwestTransport,
    TransportError,
};
use common::{fast_executor, FakeTransport, Reply, TestServer};
use serde_json::json;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

fn reqwest_transport() -> Arc<dyn HttpTransport> {
    Arc::new(ReqwestTransport::new(
        HttpClientParams {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
        },
        &ProxyConfig::disabled(),
    ))
}

#[tokio::test]
async fn test_service_unavailable_is_attempted_exactly_max_attempts() {
    let server = TestServer::start(|_| Reply::text(503, "busy")).await;
    let executor = fast_executor(reqwest_transport(), 3);

    let err = executor
        .execute(HttpRequest::get(format!("{}/search", server.url())))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RequestError::TransientNetwork { attempts: 3, .. }
    ));
    assert_eq!(err.kind(), ErrorKind::TransientNetwork);
    // Give a stray 4th request time to show up if one were sent.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.hits("/search"), 3);
}

#[tokio::test]
async fn test_not_found_is_fatal_without_retry() {
    let server = TestServer::start(|_| Reply::text(404, "missing")).await;
    let executor = fast_executor(reqwest_transport(), 5);

    let err = executor
        .execute(HttpRequest::get(format!("{}/gone", server.url())))
        .await
        .unwrap_err();

    match err {
        RequestError::FatalHttp { status, body } => {
            assert_eq!(status, 404);
            assert_eq!(body, "missing");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.hits("/gone"), 1);
}

#[tokio::test]
async fn test_recovers_after_transient_errors() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let server = TestServer::start(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Reply::text(502, "bad gateway")
        } else {
            Reply::json(200, json!({"ok": true}))
        }
    })
    .await;
    let executor = fast_executor(reqwest_transport(), 5);

    let response = executor
        .execute(HttpRequest::get(format!("{}/flaky", server.url())))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert_eq!(server.hits("/flaky"), 3);
}

#[tokio::test]
async fn test_retry_after_overrides_backoff() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let server = TestServer::start(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Reply::text(429, "slow down").header("retry-after", "1")
        } else {
            Reply::text(200, "ok")
        }
    })
    .await;
    let executor = fast_executor(reqwest_transport(), 3);

    let started = Instant::now();
    executor
        .execute(HttpRequest::get(format!("{}/limited", server.url())))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_request_headers_reach_the_server() {
    let server = TestServer::start(|_| Reply::text(200, "ok")).await;
    let executor = fast_executor(reqwest_transport(), 1);

    executor
        .execute(
            HttpRequest::post(format!("{}/form", server.url()))
                .header("content-type", "application/x-www-form-urlencoded")
                .body("a=1&b=2"),
        )
        .await
        .unwrap();

    let seen = server.requests();
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].body, "a=1&b=2");
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    // Bind then drop to get a port nothing listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let executor = fast_executor(reqwest_transport(), 2);
    let err = executor
        .execute(HttpRequest::get(format!("http://{addr}/")))
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::TransientNetwork { attempts: 2, .. }));
}

struct Envelope {
    prepared: AtomicU32,
}

#[async_trait]
impl Exchange for Envelope {
    type Output = String;

    async fn prepare(&self, attempt: u32) -> Result<HttpRequest, CaptchaError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(HttpRequest::get(format!("fake://envelope?attempt={attempt}")))
    }

    fn accept(&self, response: HttpResponse) -> Result<String, Rejection> {
        match response.body.as_str() {
            "" => Err(Rejection::Retry("empty envelope".into())),
            "forbidden" => Err(Rejection::Fatal("access denied".into())),
            body => Ok(body.to_string()),
        }
    }
}

#[tokio::test]
async fn test_rejected_envelope_is_retried() {
    let transport = FakeTransport::new(|request| {
        Ok(if request.url.ends_with("attempt=1") {
            HttpResponse::new(200, "")
        } else {
            HttpResponse::new(200, "payload")
        })
    });
    let executor = fast_executor(transport.clone(), 3);
    let exchange = Envelope {
        prepared: AtomicU32::new(0),
    };

    let output = executor.run(&exchange).await.unwrap();
    assert_eq!(output, "payload");
    assert_eq!(exchange.prepared.load(Ordering::SeqCst), 2);
    assert_eq!(transport.count(), 2);
}

#[tokio::test]
async fn test_fatal_rejection_stops_immediately() {
    let transport = FakeTransport::new(|_| Ok(HttpResponse::new(200, "forbidden")));
    let executor = fast_executor(transport.clone(), 5);
    let exchange = Envelope {
        prepared: AtomicU32::new(0),
    };

    let err = executor.run(&exchange).await.unwrap_err();
    assert!(matches!(err, RequestError::Rejected { attempts: 1, .. }));
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn test_invalid_request_is_not_retried() {
    let transport =
        FakeTransport::new(|_| Err(TransportError::Invalid("relative URL without a base".into())));
    let executor = fast_executor(transport.clone(), 5);

    let err = executor
        .execute(HttpRequest::get("not a url"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResponseRejected);
    assert_eq!(transport.count(), 1);
}

struct NoToken;

#[async_trait]
impl Exchange for NoToken {
    type Output = HttpResponse;

    async fn prepare(&self, _attempt: u32) -> Result<HttpRequest, CaptchaError> {
        Err(CaptchaError::Exhausted(vec!["browser: closed".into()]))
    }

    fn accept(&self, response: HttpResponse) -> Result<HttpResponse, Rejection> {
        Ok(response)
    }
}

#[tokio::test]
async fn test_captcha_failure_consumes_attempts() {
    let transport = FakeTransport::new(|_| Ok(HttpResponse::new(200, "ok")));
    let executor = fast_executor(transport.clone(), 3);

    let err = executor.run(&NoToken).await.unwrap_err();
    assert!(matches!(err, RequestError::Captcha { attempts: 3, .. }));
    assert_eq!(err.kind(), ErrorKind::CaptchaSolveFailure);
    assert_eq!(transport.count(), 0);
}
