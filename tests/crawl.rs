use parking_lot::Mutex;
use spider_engine::prelude::*;
use spider_engine::signals::{ENGINE_STOPPED, RESPONSE_RECEIVED};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

type Seen = Arc<Mutex<Vec<String>>>;

/// Follows every non-empty line of a page body as a relative link.
struct LinkSpider {
    start: String,
    parsed: Seen,
}

impl LinkSpider {
    fn new(start: String) -> (Self, Seen) {
        let parsed = Seen::default();
        (
            LinkSpider {
                start,
                parsed: Arc::clone(&parsed),
            },
            parsed,
        )
    }
}

#[async_trait]
impl Spider for LinkSpider {
    fn name(&self) -> &str {
        "links"
    }

    fn start_requests(&mut self) -> Result<Vec<Request>, SpiderError> {
        Ok(vec![Request::new(&self.start)?])
    }

    async fn parse(&mut self, response: Response) -> Result<ParseOutput, SpiderError> {
        self.parsed
            .lock()
            .push(format!("{} {}", response.status().as_u16(), response.url().path()));
        let mut output = ParseOutput::new();
        for line in response.text().lines().filter(|l| !l.trim().is_empty()) {
            let url = response.url().join(line.trim())?;
            output.add_request(Request::from_url(url)?);
        }
        Ok(output)
    }
}

async fn site() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(header("user-agent", "integration-test"))
        .respond_with(ResponseTemplate::new(200).set_body_string("/flaky\n/old\n/a"))
        .mount(&server)
        .await;
    Mock::given(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("/a"))
        .mount(&server)
        .await;
    Mock::given(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
        .mount(&server)
        .await;
    Mock::given(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&server)
        .await;
    Mock::given(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("/"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn crawls_site_with_retry_redirect_and_dedup() {
    let server = site().await;
    let (spider, parsed) = LinkSpider::new(format!("{}/", server.uri()));
    let received = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&received);

    let mut engine = EngineBuilder::new(spider)
        .setting("USER_AGENT", "integration-test")
        .concurrent_requests(4)
        .connect(RESPONSE_RECEIVED, move |_| {
            *counter.lock() += 1;
            Ok(SignalOutcome::Done)
        })
        .build()
        .unwrap();

    engine.run().await.unwrap();

    let mut parsed = parsed.lock().clone();
    parsed.sort();
    assert_eq!(parsed, vec!["200 /", "200 /a", "200 /flaky", "200 /new"]);
    assert_eq!(*received.lock(), 4);
    assert_eq!(engine.stop_reason(), Some("finished"));

    let stats = engine.stats();
    assert_eq!(stats.requests_retried(), 1);
    assert_eq!(stats.requests_redirected(), 1);
    assert_eq!(stats.status_count(503), 1);
    assert_eq!(stats.status_count(301), 1);
    assert!(stats.requests_dropped() >= 2);
}

#[tokio::test]
async fn pause_and_unpause_through_handle() {
    let server = site().await;
    let (spider, parsed) = LinkSpider::new(format!("{}/", server.uri()));
    let mut engine = EngineBuilder::new(spider)
        .setting("USER_AGENT", "integration-test")
        .build()
        .unwrap();
    let handle = engine.handle();

    handle.pause().unwrap();
    let task = tokio::spawn(async move {
        engine.run().await.unwrap();
        engine
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handle.state(), EngineState::Paused);
    assert!(parsed.lock().is_empty());

    handle.unpause().unwrap();
    let engine = task.await.unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(parsed.lock().len(), 4);
}

#[tokio::test]
async fn stop_twice_then_restart_fails() {
    let server = MockServer::start().await;
    Mock::given(path("/"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;
    let (spider, parsed) = LinkSpider::new(format!("{}/", server.uri()));
    let stopped: Seen = Seen::default();
    let seen = Arc::clone(&stopped);
    let mut engine = EngineBuilder::new(spider)
        .setting("SHUTDOWN_TIMEOUT", 0.2)
        .connect(ENGINE_STOPPED, move |args| {
            if let SignalArgs::Reason(reason) = args {
                seen.lock().push(reason.to_string());
            }
            Ok(SignalOutcome::Done)
        })
        .build()
        .unwrap();
    let handle = engine.handle();

    handle.stop("first").unwrap();
    handle.stop("second").unwrap();
    engine.run().await.unwrap();

    assert_eq!(*stopped.lock(), vec!["first"]);
    assert_eq!(engine.stats().requests_abandoned(), 1);
    assert!(parsed.lock().is_empty());
    assert!(engine.run().await.is_err());
    assert!(handle.stop("third").is_ok());
}
