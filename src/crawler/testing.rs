//! Test doubles shared by the crawler unit tests
//!
//! Sites are addressed as `https://{id}.example/`; the search page for the
//! query "desk lamp" is `https://{id}.example/search?q=desk+lamp`.

use super::coordinator::CrawlContext;
use super::fetcher::{FetchResult, PageFetcher};
use super::registry::TaskStore;
use super::task::{SubmitOptions, Task, TaskId};
use crate::antibot::RequestProfile;
use crate::config::{Config, RateLimitConfig, SiteConfig};
use crate::crawler::HtmlExtractor;
use crate::output::{EventSender, Notifier, TaskEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn site_config(id: &str) -> SiteConfig {
    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), "h1".to_string());
    SiteConfig {
        id: id.to_string(),
        name: None,
        search_url: format!("https://{}.example/search?q={{query}}", id),
        link_selector: "a.result".to_string(),
        fields,
        max_detail_links: None,
    }
}

/// Valid config with fast, generous rate limits
pub(crate) fn test_config(site_ids: &[&str]) -> Config {
    let mut config = Config {
        rate_limit: RateLimitConfig {
            requests_per_second: 1000.0,
            requests_per_minute: 100_000,
            requests_per_hour: 1_000_000,
            burst_size: 1000,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            ..RateLimitConfig::default()
        },
        sites: site_ids.iter().map(|id| site_config(id)).collect(),
        ..Config::default()
    };
    config.scheduler.task_timeout_ms = 600_000;
    config
}

/// Fetcher answering from a fixed script
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    responses: HashMap<String, FetchResult>,
    site_failures: HashMap<String, FetchResult>,
    slow: HashMap<String, Duration>,
    latency: Duration,
    requests: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(mut self, url: &str, result: FetchResult) -> Self {
        self.responses.insert(url.to_string(), result);
        self
    }

    /// Search page for "desk lamp" linking to `paths`
    pub(crate) fn listing(self, site: &str, paths: &[&str]) -> Self {
        let body: String = paths
            .iter()
            .map(|p| format!(r#"<a class="result" href="{}">item</a>"#, p))
            .collect();
        let url = format!("https://{}.example/search?q=desk+lamp", site);
        self.respond(&url, success(&url, format!("<html><body>{}</body></html>", body)))
    }

    /// Detail page at `path` whose `h1` is `title`
    pub(crate) fn detail(self, site: &str, path: &str, title: &str) -> Self {
        let url = format!("https://{}.example{}", site, path);
        self.respond(&url, success(&url, format!("<html><h1>{}</h1></html>", title)))
    }

    /// Every unscripted URL on `site` answers with `result`
    pub(crate) fn fail_site(mut self, site: &str, result: FetchResult) -> Self {
        self.site_failures.insert(site_prefix(site), result);
        self
    }

    /// Every request to `site` takes `delay`
    pub(crate) fn slow_site(mut self, site: &str, delay: Duration) -> Self {
        self.slow.insert(site_prefix(site), delay);
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn requested(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub(crate) fn calls(&self, site: &str) -> usize {
        let prefix = site_prefix(site);
        self.requests
            .lock()
            .iter()
            .filter(|u| u.starts_with(&prefix))
            .count()
    }
}

fn site_prefix(site: &str) -> String {
    format!("https://{}.example/", site)
}

fn success(url: &str, body: String) -> FetchResult {
    FetchResult::Success {
        final_url: url.to_string(),
        status_code: 200,
        body,
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _profile: &RequestProfile) -> FetchResult {
        self.requests.lock().push(url.to_string());

        let delay = self
            .slow
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map_or(self.latency, |(_, d)| *d);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(result) = self.responses.get(url) {
            return result.clone();
        }
        if let Some((_, result)) = self
            .site_failures
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
        {
            return result.clone();
        }

        FetchResult::HttpError {
            status_code: 404,
            body: String::new(),
            retry_after: None,
        }
    }
}

/// Notifier keeping every event it receives
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingNotifier {
    pub(crate) fn names_for(&self, task_id: TaskId) -> Vec<&'static str> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id() == task_id)
            .map(|e| e.name())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn emit(&self, event: TaskEvent) {
        self.events.lock().push(event);
    }
}

pub(crate) fn build_context(
    config: &Config,
    fetcher: Arc<dyn PageFetcher>,
    events: EventSender,
) -> CrawlContext {
    CrawlContext::new(
        config,
        Arc::new(TaskStore::new()),
        fetcher,
        Arc::new(HtmlExtractor::new()),
        events,
    )
}

/// Coordinator-level harness around a scripted fetcher
pub(crate) struct Harness {
    pub(crate) ctx: Arc<CrawlContext>,
    pub(crate) fetcher: Arc<ScriptedFetcher>,
    config: Config,
    sites: HashMap<String, Arc<SiteConfig>>,
}

pub(crate) fn harness(fetcher: ScriptedFetcher, site_ids: &[&str]) -> Harness {
    let config = test_config(site_ids);
    let fetcher = Arc::new(fetcher);
    let ctx = build_context(&config, fetcher.clone(), EventSender::disabled());
    let sites = config
        .sites
        .iter()
        .map(|s| (s.id.clone(), Arc::new(s.clone())))
        .collect();

    Harness {
        ctx: Arc::new(ctx),
        fetcher,
        config,
        sites,
    }
}

impl Harness {
    pub(crate) fn site(&self, id: &str) -> Arc<SiteConfig> {
        self.sites
            .get(id)
            .cloned()
            .unwrap_or_else(|| Arc::new(site_config(id)))
    }

    pub(crate) fn set_site_limit(&mut self, id: &str, limit: usize) {
        let mut site = (*self.site(id)).clone();
        site.max_detail_links = Some(limit);
        self.sites.insert(id.to_string(), Arc::new(site));
    }

    /// Queues and admits a task over `sites`, returning its id
    pub(crate) fn admit(&self, sites: &[&str]) -> TaskId {
        let task = Task::new(
            "desk lamp".to_string(),
            sites.iter().map(|s| s.to_string()).collect(),
            SubmitOptions::default().resolve(&self.config.scheduler),
        );
        let id = task.id;
        self.ctx
            .store
            .enqueue(task, usize::MAX)
            .expect("queue has room");
        self.ctx.store.admit_next(usize::MAX);
        id
    }
}
