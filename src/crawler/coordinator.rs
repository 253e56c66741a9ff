//! Per-site crawl coordinator
//!
//! One coordinator runs for each `(task, site)` pair. It drives the site's
//! search -> listing -> detail pipeline:
//! - Asking the supervisor for a request profile before every request
//! - Fetching with retries according to the retry policy
//! - Handing pages to the extractor
//! - Reporting results, errors and the site's final outcome to the store
//!
//! Failures never leave the coordinator: a site that gives up counts once
//! as failed and siblings carry on. Every suspension point observes the
//! task's pause gate and cancellation token.

use super::fetcher::{FetchResult, PageFetcher};
use super::registry::TaskStore;
use super::task::TaskId;
use crate::antibot::{
    AntiDetectionSupervisor, EscalationAction, Outcome, ProxyRotator, RateLimiter, RequestProfile,
};
use crate::config::{Config, SiteConfig};
use crate::failure::{CrawlError, ErrorClassifier, RawFailure, RetryPolicy};
use crate::output::{EventSender, Extractor, Page, TaskEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Collaborators shared by every coordinator of a scheduler
pub struct CrawlContext {
    pub store: Arc<TaskStore>,
    pub supervisor: Arc<AntiDetectionSupervisor>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: Arc<dyn Extractor>,
    pub classifier: ErrorClassifier,
    pub retry: RetryPolicy,
    pub events: EventSender,
    /// Default cap on detail links per site
    pub max_detail_links: usize,
}

impl CrawlContext {
    /// Wires the anti-detection layer and failure handling from `config`
    pub fn new(
        config: &Config,
        store: Arc<TaskStore>,
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn Extractor>,
        events: EventSender,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let rotator = Arc::new(ProxyRotator::new(
            config.proxies.clone(),
            config.proxy_pool.clone(),
        ));

        Self {
            store,
            supervisor: Arc::new(AntiDetectionSupervisor::new(
                config.anti_detection.clone(),
                limiter,
                rotator,
            )),
            fetcher,
            extractor,
            classifier: ErrorClassifier::for_config(&config.anti_detection),
            retry: RetryPolicy::new(&config.retry),
            events,
            max_detail_links: config.crawler.max_detail_links,
        }
    }
}

/// Lifecycle signals for one task, shared by its site workers
#[derive(Debug, Clone)]
pub struct TaskSignals {
    pub cancel: CancellationToken,
    /// `true` while the task is paused
    pub paused: watch::Receiver<bool>,
}

impl TaskSignals {
    /// Parks while the task is paused
    ///
    /// Returns false if the task was cancelled meanwhile.
    async fn wait_if_paused(&mut self) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*self.paused.borrow_and_update() {
                return true;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        // Sender gone: the task is over
                        return false;
                    }
                }
            }
        }
    }

    /// Sleeps for `duration` unless cancelled first
    async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Outcome of one network step after retries
enum Step {
    Done(Page),
    Failed(CrawlError),
    Cancelled,
}

/// Runs one site's crawl for one task
pub struct SiteCrawlCoordinator {
    ctx: Arc<CrawlContext>,
    task_id: TaskId,
    query: String,
    site: Arc<SiteConfig>,
    max_attempts: u32,
    signals: TaskSignals,
    /// Requests issued so far, across all steps
    attempts: u32,
    last_error: Option<CrawlError>,
}

impl SiteCrawlCoordinator {
    pub fn new(
        ctx: Arc<CrawlContext>,
        task_id: TaskId,
        query: String,
        site: Arc<SiteConfig>,
        max_attempts: u32,
        signals: TaskSignals,
    ) -> Self {
        Self {
            ctx,
            task_id,
            query,
            site,
            max_attempts: max_attempts.max(1),
            signals,
            attempts: 0,
            last_error: None,
        }
    }

    /// Runs the pipeline to completion, cancellation or failure
    pub async fn run(mut self) {
        let site_id = self.site.id.clone();
        tracing::info!(task_id = %self.task_id, site = %site_id, "Site crawl started");

        let Some(success) = self.crawl().await else {
            tracing::info!(task_id = %self.task_id, site = %site_id, "Site crawl cancelled");
            return;
        };

        if !success {
            if let Some(error) = self.last_error.take() {
                self.report_error(error);
            }
        }

        if let Some(finish) = self.ctx.store.site_finished(&self.task_id, success) {
            tracing::info!(
                task_id = %self.task_id,
                site = %site_id,
                success = success,
                requests = self.attempts,
                completed = finish.progress.completed,
                failed = finish.progress.failed,
                total = finish.progress.total,
                "Site crawl finished"
            );
            self.ctx.events.send(TaskEvent::TaskProgress {
                task_id: self.task_id,
                site_id,
                progress: finish.progress,
                estimated_end_time: finish.estimated_end_time,
            });
        }
    }

    /// Returns whether the site succeeded, or None if cancelled
    ///
    /// On failure `last_error` holds the error that sank the site, unless
    /// it was already reported.
    async fn crawl(&mut self) -> Option<bool> {
        let search_url = self.site.search_url_for(&self.query);

        let listing = match self.fetch_with_retry(&search_url).await {
            Step::Done(page) => page,
            Step::Failed(error) => {
                self.last_error = Some(error);
                return Some(false);
            }
            Step::Cancelled => return None,
        };

        let mut links = match self.ctx.extractor.extract_links(&self.site, &listing) {
            Ok(links) => links,
            Err(e) => {
                let raw = RawFailure::Extraction(e);
                self.last_error =
                    Some(self.ctx.classifier.classify(&self.site.id, Some(&listing.url), &raw));
                return Some(false);
            }
        };

        let limit = self
            .site
            .max_detail_links
            .unwrap_or(self.ctx.max_detail_links);
        links.truncate(limit);

        tracing::debug!(
            task_id = %self.task_id,
            site = %self.site.id,
            links = links.len(),
            "Extracted detail links"
        );

        if links.is_empty() {
            return Some(true);
        }

        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut results = 0usize;

        for link in &links {
            if self.ctx.store.is_full(&self.task_id) {
                tracing::debug!(task_id = %self.task_id, site = %self.site.id, "Result limit reached");
                break;
            }
            attempted += 1;

            let page = match self.fetch_with_retry(link).await {
                Step::Done(page) => page,
                Step::Failed(error) => {
                    failed += 1;
                    self.report_error(error);
                    continue;
                }
                Step::Cancelled => return None,
            };

            match self.ctx.extractor.extract_detail(&self.site, &page) {
                Ok(Some(result)) => {
                    if self.ctx.store.record_result(&self.task_id, result.clone()) {
                        results += 1;
                        self.ctx.events.send(TaskEvent::TaskResult {
                            task_id: self.task_id,
                            result,
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    failed += 1;
                    let raw = RawFailure::Extraction(e);
                    let error = self.ctx.classifier.classify(&self.site.id, Some(&page.url), &raw);
                    self.report_error(error);
                }
            }
        }

        // Detail errors were already reported one by one
        self.last_error = None;
        Some(results > 0 || attempted == 0 || failed < attempted)
    }

    /// Fetches `url`, retrying per policy
    async fn fetch_with_retry(&mut self, url: &str) -> Step {
        let mut attempt = 0u32;
        let mut backoff = Duration::ZERO;

        loop {
            if !self.signals.wait_if_paused().await {
                return Step::Cancelled;
            }

            let Some(profile) = self
                .ctx
                .supervisor
                .prepare(&self.site.id, &self.signals.cancel)
                .await
            else {
                return Step::Cancelled;
            };

            // The first request of a site skips the adaptive delay; cooldowns
            // and Retry-After floors were already honoured by `prepare`
            let pause = if self.attempts == 0 {
                backoff
            } else {
                profile.delay.max(backoff)
            };
            if !self.signals.sleep(pause).await {
                return Step::Cancelled;
            }

            attempt += 1;
            self.attempts += 1;

            let error = match self.fetch_once(url, &profile).await {
                Some(Ok(page)) => return Step::Done(page),
                Some(Err(error)) => error,
                None => return Step::Cancelled,
            };

            if !self.ctx.retry.should_retry(&error, attempt, self.max_attempts) {
                tracing::debug!(
                    task_id = %self.task_id,
                    site = %self.site.id,
                    url = %url,
                    attempt = attempt,
                    kind = %error.kind,
                    "Giving up on request"
                );
                return Step::Failed(error);
            }

            backoff = self.ctx.retry.backoff(attempt);
            tracing::debug!(
                task_id = %self.task_id,
                site = %self.site.id,
                url = %url,
                attempt = attempt,
                kind = %error.kind,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying request"
            );
        }
    }

    /// Issues one request and reports its outcome to the supervisor
    ///
    /// Returns None if cancelled while the request was in flight.
    async fn fetch_once(
        &self,
        url: &str,
        profile: &RequestProfile,
    ) -> Option<Result<Page, CrawlError>> {
        let site_id = self.site.id.as_str();
        let proxy_key = profile.proxy.as_ref().map(|p| p.key());
        let started = Instant::now();

        let fetched = tokio::select! {
            biased;
            _ = self.signals.cancel.cancelled() => return None,
            fetched = self.ctx.fetcher.fetch(url, profile) => fetched,
        };
        let response_time = started.elapsed();

        let error = match fetched {
            FetchResult::Success {
                final_url,
                status_code,
                body,
            } => match self
                .ctx
                .classifier
                .classify_response(site_id, url, status_code, &body, None)
            {
                None => {
                    self.ctx
                        .supervisor
                        .record_outcome(site_id, &Outcome::success(response_time, proxy_key));
                    return Some(Ok(Page {
                        url: final_url,
                        status_code,
                        body,
                    }));
                }
                Some(error) => error,
            },
            FetchResult::HttpError {
                status_code,
                body,
                retry_after,
            } => self.ctx.classifier.classify(
                site_id,
                Some(url),
                &RawFailure::Http {
                    status: status_code,
                    body,
                    retry_after,
                },
            ),
            FetchResult::NetworkError { kind, error } => self.ctx.classifier.classify(
                site_id,
                Some(url),
                &RawFailure::Network {
                    kind,
                    message: error,
                },
            ),
        };

        let action = self.ctx.supervisor.record_outcome(
            site_id,
            &Outcome {
                success: false,
                response_time,
                status_code: error.status_code,
                retry_after: error.retry_after(),
                error_kind: Some(error.kind),
                proxy_key,
            },
        );

        if let EscalationAction::SkipItem { .. } = action {
            tracing::info!(task_id = %self.task_id, site = %site_id, url = %url, "Skipping item behind captcha");
        }

        Some(Err(error))
    }

    fn report_error(&self, error: CrawlError) {
        if self.ctx.store.record_error(&self.task_id, error.clone()) {
            self.ctx.events.send(TaskEvent::TaskError {
                task_id: self.task_id,
                error,
            });
        }
    }
}
