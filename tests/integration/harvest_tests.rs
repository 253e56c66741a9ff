//! Integration tests for the harvester
//!
//! These tests use wiremock to stand up fake search sites and run whole
//! tasks through the scheduler, the real HTTP fetcher and the HTML
//! extractor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use sumi_harvest::config::{parse_config, Config, RateLimitConfig, RetryConfig, SiteConfig};
use sumi_harvest::crawler::{HtmlExtractor, HttpFetcher, SubmitOptions, TaskScheduler, TaskStore};
use sumi_harvest::output::EventSender;
use sumi_harvest::{ErrorKind, HarvestError, TaskStatus};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a site whose search page lives at `{base}/search`
fn site(id: &str, base: &str) -> SiteConfig {
    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), "h1".to_string());
    fields.insert("price".to_string(), ".price".to_string());
    SiteConfig {
        id: id.to_string(),
        name: Some(format!("Test site {}", id)),
        search_url: format!("{}/search?q={{query}}", base),
        link_selector: "a.result".to_string(),
        fields,
        max_detail_links: None,
    }
}

/// Creates a test configuration with fast pacing and short backoff
fn create_test_config(sites: Vec<SiteConfig>) -> Config {
    Config {
        rate_limit: RateLimitConfig {
            requests_per_second: 100.0,
            requests_per_minute: 10_000,
            requests_per_hour: 100_000,
            burst_size: 100,
            base_delay_ms: 5,
            max_delay_ms: 50,
            ..RateLimitConfig::default()
        },
        retry: RetryConfig {
            base_delay_ms: 10,
            max_delay_ms: 100,
        },
        sites,
        ..Config::default()
    }
}

fn scheduler(config: Config) -> TaskScheduler {
    TaskScheduler::new(
        config.clone(),
        Arc::new(TaskStore::new()),
        Arc::new(HttpFetcher::new(config.crawler.clone())),
        Arc::new(HtmlExtractor::new()),
        EventSender::disabled(),
    )
    .expect("valid test config")
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html")
        .set_body_string(format!("<html><body>{}</body></html>", body))
}

async fn mount_page(server: &MockServer, page_path: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(page_path))
        .respond_with(html(body))
        .mount(server)
        .await;
}

/// Mounts a listing linking to `/item/{n}` for each n, plus those pages
async fn mount_shop(server: &MockServer, items: &[(u32, &str, &str)]) {
    let links: String = items
        .iter()
        .map(|(n, _, _)| format!(r#"<a class="result" href="/item/{}">item</a>"#, n))
        .collect();
    mount_page(server, "/search", &links).await;

    for (n, title, price) in items {
        let body = format!(r#"<h1>{}</h1><span class="price">{}</span>"#, title, price);
        mount_page(server, &format!("/item/{}", n), &body).await;
    }
}

#[tokio::test]
async fn test_full_search_single_site() {
    let server = MockServer::start().await;
    mount_shop(&server, &[(1, "Brass lamp", "$40"), (2, "Steel lamp", "$25")]).await;

    let scheduler = scheduler(create_test_config(vec![site("shop", &server.uri())]));
    let id = scheduler
        .submit("desk lamp", &["shop"], SubmitOptions::default())
        .unwrap();
    let task = scheduler.wait_for(&id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.errors.is_empty(), "unexpected errors: {:?}", task.errors);
    assert_eq!(task.results.len(), 2);

    let first = &task.results[0];
    assert_eq!(first.site_id, "shop");
    assert_eq!(first.url, format!("{}/item/1", server.uri()));
    assert_eq!(first.fields["title"], "Brass lamp");
    assert_eq!(first.fields["price"], "$40");

    let stats = scheduler.stats();
    assert_eq!(stats.archived_completed, 1);
    assert_eq!(stats.active(), 0);
}

#[tokio::test]
async fn test_search_across_sites_with_missing_detail() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    mount_shop(&first, &[(1, "Brass lamp", "$40")]).await;

    // Second site links to a page that does not exist
    mount_page(
        &second,
        "/search",
        r#"<a class="result" href="/item/7">a</a><a class="result" href="/item/8">b</a>"#,
    )
    .await;
    mount_page(&second, "/item/7", "<h1>Clamp lamp</h1>").await;

    let config = create_test_config(vec![site("first", &first.uri()), site("second", &second.uri())]);
    let scheduler = scheduler(config);
    let id = scheduler
        .submit("desk lamp", &["first", "second"], SubmitOptions::default())
        .unwrap();
    let task = scheduler.wait_for(&id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress.completed, 2);
    assert_eq!(task.progress.failed, 0);
    assert_eq!(task.results.len(), 2);

    assert_eq!(task.errors.len(), 1);
    assert_eq!(task.errors[0].site_id.as_deref(), Some("second"));
    assert_eq!(task.errors[0].status_code, Some(404));
}

#[tokio::test]
async fn test_unreachable_site_fails_without_sinking_task() {
    let server = MockServer::start().await;
    mount_shop(&server, &[(1, "Brass lamp", "$40")]).await;

    // Nothing listens on port 9 of the loopback interface
    let config = create_test_config(vec![
        site("up", &server.uri()),
        site("down", "http://127.0.0.1:9"),
    ]);
    let scheduler = scheduler(config);
    let options = SubmitOptions {
        retry_attempts: Some(2),
        ..SubmitOptions::default()
    };
    let id = scheduler.submit("desk lamp", &["up", "down"], options).unwrap();
    let task = scheduler.wait_for(&id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress.completed, 1);
    assert_eq!(task.progress.failed, 1);
    assert_eq!(task.results.len(), 1);

    let down: Vec<_> = task
        .errors
        .iter()
        .filter(|e| e.site_id.as_deref() == Some("down"))
        .collect();
    assert_eq!(down.len(), 1);
    assert!(down[0].recoverable);
    assert_eq!(down[0].kind.category(), ErrorKind::Network.category());
}

#[tokio::test]
async fn test_captcha_page_is_classified_and_skipped() {
    let server = MockServer::start().await;
    mount_page(&server, "/search", r#"<a class="result" href="/item/1">one</a>"#).await;
    mount_page(
        &server,
        "/item/1",
        r#"<h1>Lamp</h1><div class="g-recaptcha" data-sitekey="x"></div>"#,
    )
    .await;

    let scheduler = scheduler(create_test_config(vec![site("shop", &server.uri())]));
    let id = scheduler
        .submit("desk lamp", &["shop"], SubmitOptions::default())
        .unwrap();
    let task = scheduler.wait_for(&id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.results.is_empty());
    assert_eq!(task.errors.len(), 1);
    assert_eq!(task.errors[0].kind, ErrorKind::CaptchaRequired);

    // Captcha pages are not retried; the site sits out a cooldown instead
    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 2);
    assert!(scheduler.site_snapshot("shop").cooldown_remaining.is_some());
}

#[tokio::test]
async fn test_timeout_keeps_partial_results() {
    let fast = MockServer::start().await;
    let slow = MockServer::start().await;
    mount_shop(&fast, &[(1, "Brass lamp", "$40")]).await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html("").set_delay(Duration::from_secs(10)))
        .mount(&slow)
        .await;

    let config = create_test_config(vec![site("fast", &fast.uri()), site("slow", &slow.uri())]);
    let scheduler = scheduler(config);
    let options = SubmitOptions {
        timeout: Some(Duration::from_millis(1500)),
        ..SubmitOptions::default()
    };
    let id = scheduler.submit("desk lamp", &["fast", "slow"], options).unwrap();

    let task = tokio::time::timeout(Duration::from_secs(5), scheduler.wait_for(&id))
        .await
        .expect("task should time out on its own")
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.results.len(), 1);
    assert!(task
        .errors
        .iter()
        .any(|e| e.kind == ErrorKind::Timeout && e.site_id.is_none()));
    assert_eq!(task.progress.finished(), task.progress.total);
}

#[tokio::test]
async fn test_cancel_running_task() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html("").set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let scheduler = scheduler(create_test_config(vec![site("shop", &server.uri())]));
    let id = scheduler
        .submit("desk lamp", &["shop"], SubmitOptions::default())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(scheduler.cancel(&id));

    let task = scheduler.wait_for(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.errors.len(), 1);
    assert_eq!(task.errors[0].kind, ErrorKind::Cancelled);
    assert!(!scheduler.pause(&id));
}

#[tokio::test]
async fn test_submission_rejected_for_bad_site_rules() {
    let mut broken = site("broken", "https://shop.example");
    broken.link_selector = String::new();

    // Bad rules fail the whole configuration up front
    let err = TaskScheduler::new(
        create_test_config(vec![broken]),
        Arc::new(TaskStore::new()),
        Arc::new(HttpFetcher::new(Default::default())),
        Arc::new(HtmlExtractor::new()),
        EventSender::disabled(),
    )
    .err()
    .expect("config should be rejected");
    assert!(matches!(err, HarvestError::Config(_)));

    let scheduler = scheduler(create_test_config(vec![site("ok", "https://shop.example")]));
    let err = scheduler
        .submit("desk lamp", &["nope"], SubmitOptions::default())
        .unwrap_err();
    assert!(matches!(err, HarvestError::Config(_)));
    assert_eq!(scheduler.stats().queued, 0);
}

#[test]
fn test_parse_config_from_toml() {
    let toml = r#"
        [scheduler]
        max-concurrent-tasks = 2
        task-timeout-ms = 60000

        [rate-limit]
        requests-per-second = 2.0
        base-delay-ms = 500
        max-delay-ms = 10000

        [[proxy]]
        host = "10.0.0.1"
        port = 8080

        [[site]]
        id = "shop"
        search-url = "https://shop.example/search?q={query}"
        link-selector = "a.result"

        [site.fields]
        title = "h1"
    "#;

    let config = parse_config(toml).unwrap();
    assert_eq!(config.scheduler.max_concurrent_tasks, 2);
    assert_eq!(config.scheduler.max_queue_size, 50);
    assert_eq!(config.proxies.len(), 1);
    assert_eq!(config.sites[0].fields["title"], "h1");
    assert_eq!(
        config.sites[0].search_url_for("desk lamp"),
        "https://shop.example/search?q=desk+lamp"
    );
}
