mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pagesmith::catalog::{BackendCatalog, CatalogSettings, QualityTable};
use pagesmith::dispatch::{DispatchSettings, Dispatcher, FailureKind};
use pagesmith::gateway::{GenerationClient, PromptPayload, ProviderError, SendOptions};
use pagesmith::pipeline::{PipelineCoordinator, PipelineError, PipelineSettings, PipelineState, TaskStatus};
use pagesmith::prompts::{ContentBrief, PageBrief};
use pagesmith::roles::RoleResolver;
use pagesmith::trust::TrustLedger;
use tokio_util::sync::CancellationToken;

use common::{foundation_json, free_listing, page_json, FakeSource};

const LEAD: &str = "lead/model:free";
const WORKER: &str = "worker/model:free";

/// Answers by looking at the prompt: the foundation prompt gets the shell,
/// page prompts get a body for the page they name.
#[derive(Default)]
struct SiteClient {
    /// Pages whose first answer nests a full document.
    nest_first: Vec<String>,
    /// Pages that always nest.
    always_nest: Vec<String>,
    fail_foundation: bool,
    /// Foundation stylesheet uses a literal color outside `:root`.
    literal_colors: bool,
    /// Page bodies carry an inline style with a literal color.
    page_literal_colors: bool,
    prompts: Mutex<Vec<(String, String)>>,
}

fn page_path(prompt: &str) -> Option<String> {
    let start = prompt.find("<page path=\"")? + "<page path=\"".len();
    let end = prompt[start..].find('"')? + start;
    Some(prompt[start..end].to_string())
}

fn nested_json(path: &str) -> String {
    let doc = format!(
        "<!doctype html><html><body><main>{}</main></body></html>",
        "Lots of content that is long enough to be a page. ".repeat(4)
    );
    serde_json::json!({ "files": { path: doc }, "entry": path }).to_string()
}

#[async_trait]
impl GenerationClient for SiteClient {
    async fn send(
        &self,
        backend_id: &str,
        payload: &PromptPayload,
        _options: &SendOptions,
    ) -> Result<String, ProviderError> {
        let prompt: String = payload
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts
            .lock()
            .unwrap()
            .push((backend_id.to_string(), prompt.clone()));

        let Some(path) = page_path(&prompt) else {
            if self.fail_foundation {
                return Err(ProviderError::provider("fake", "connection reset", true));
            }
            if self.literal_colors {
                return Ok(foundation_json().replace("var(--ink)", "#ff0000"));
            }
            return Ok(foundation_json());
        };
        let escalated = prompt.contains("was rejected");
        if self.always_nest.contains(&path) || (self.nest_first.contains(&path) && !escalated) {
            return Ok(nested_json(&path));
        }
        if self.page_literal_colors {
            return Ok(page_json(&path).replace("<main>", "<main><style>.note { color: #000000; }</style>"));
        }
        Ok(page_json(&path))
    }
}

fn brief(pages: &[(&str, bool)]) -> ContentBrief {
    ContentBrief {
        site_name: "Harbor Bakery".into(),
        summary: "A neighbourhood bakery.".into(),
        audience: Some("locals".into()),
        tone: None,
        pages: pages
            .iter()
            .map(|(path, required)| PageBrief {
                path: path.to_string(),
                title: None,
                purpose: format!("the {path} page"),
                required: *required,
            })
            .collect(),
    }
}

fn coordinator(client: Arc<SiteClient>, source: Arc<FakeSource>) -> PipelineCoordinator {
    let quality: QualityTable = serde_json::from_value(serde_json::json!({
        "scores": { "site": { LEAD: 0.9, WORKER: 0.6 } }
    }))
    .unwrap();
    let catalog = Arc::new(BackendCatalog::new(source, quality, CatalogSettings::default()));

    let ledger = TrustLedger::in_memory();
    ledger.record_success(LEAD);
    ledger.record_success(WORKER);

    let dispatcher = Dispatcher::new(
        client,
        Arc::new(ledger),
        RoleResolver::default(),
        DispatchSettings::default(),
    );
    PipelineCoordinator::new(
        catalog,
        dispatcher,
        PipelineSettings {
            pipeline_timeout: Duration::from_secs(30),
            ..PipelineSettings::default()
        },
    )
}

fn listings() -> Arc<FakeSource> {
    FakeSource::new(vec![free_listing(LEAD, 65_536), free_listing(WORKER, 32_768)])
}

#[tokio::test]
async fn brief_becomes_a_merged_site() {
    let client = Arc::new(SiteClient::default());
    let session = coordinator(client.clone(), listings())
        .run(&brief(&[("about.html", true), ("menu.html", true)]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(session.state, PipelineState::Done);
    assert_eq!(session.summary, "3 of 3 produced");
    assert_eq!(session.artifacts.entry.as_deref(), Some("index.html"));
    let paths: Vec<_> = session.artifacts.files.keys().cloned().collect();
    assert_eq!(paths, vec!["about.html", "index.html", "menu.html", "styles.css"]);

    let states: Vec<_> = session.transitions.iter().map(|t| t.to).collect();
    assert_eq!(states.first(), Some(&PipelineState::CatalogReady));
    assert_eq!(states[1], PipelineState::RoleResolved);
    assert_eq!(states.last(), Some(&PipelineState::Done));

    // Foundation went to the authoritative head, pages to bulk, and every
    // page prompt carried the shared chrome.
    let prompts = client.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 3);
    assert_eq!(prompts[0].0, LEAD);
    for (backend, prompt) in &prompts[1..] {
        assert_eq!(backend, WORKER);
        assert!(prompt.contains("styles.css"));
        assert!(prompt.contains("--ink"));
    }
}

#[tokio::test]
async fn nested_document_is_escalated_and_fixed() {
    let client = Arc::new(SiteClient {
        nest_first: vec!["about.html".into()],
        ..SiteClient::default()
    });
    let session = coordinator(client.clone(), listings())
        .run(&brief(&[("about.html", true), ("menu.html", true)]), &CancellationToken::new())
        .await
        .unwrap();

    assert!(session.is_done(), "{:?}", session.transitions);
    let about = session.task("about.html").unwrap();
    assert_eq!(about.status, TaskStatus::Produced);
    assert_eq!(about.escalations, 1);
    assert_eq!(about.attempted_backends, vec![WORKER, LEAD]);
    assert!(session.transitions.iter().any(|t| t.to == PipelineState::Retry));

    let menu = session.task("menu.html").unwrap();
    assert_eq!(menu.escalations, 0);

    let body = &session.artifacts.files["about.html"];
    assert!(!body.to_ascii_lowercase().contains("<!doctype"));
}

#[tokio::test]
async fn optional_page_failure_is_partial_success() {
    let client = Arc::new(SiteClient {
        always_nest: vec!["blog.html".into()],
        ..SiteClient::default()
    });
    let session = coordinator(client, listings())
        .run(&brief(&[("about.html", true), ("blog.html", false)]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(session.state, PipelineState::Done);
    assert_eq!(session.summary, "2 of 3 produced");
    let blog = session.task("blog.html").unwrap();
    assert_eq!(blog.status, TaskStatus::Failed);
    assert_eq!(blog.failure_kind, Some(FailureKind::ValidationError));
    assert_eq!(blog.escalations, 1);
    assert!(blog.message.as_deref().unwrap_or("").contains("document wrapper"));
    assert!(!session.artifacts.files.contains_key("blog.html"));
}

#[tokio::test]
async fn validation_failures_count_against_the_backend() {
    let client = Arc::new(SiteClient {
        always_nest: vec!["blog.html".into()],
        ..SiteClient::default()
    });
    let coordinator = coordinator(client, listings());
    let session = coordinator
        .run(&brief(&[("blog.html", false)]), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(session.task("blog.html").unwrap().attempted_backends, vec![WORKER, LEAD]);

    let ledger = coordinator.dispatcher().ledger();
    // Seeded with one success each; the foundation added one to the lead.
    let worker = ledger.record(WORKER).unwrap();
    assert_eq!((worker.success_count, worker.failure_count), (1, 1));
    let lead = ledger.record(LEAD).unwrap();
    assert_eq!((lead.success_count, lead.failure_count), (2, 1));
}

#[tokio::test]
async fn required_page_failure_fails_the_run() {
    let client = Arc::new(SiteClient {
        always_nest: vec!["about.html".into()],
        ..SiteClient::default()
    });
    let session = coordinator(client, listings())
        .run(&brief(&[("about.html", true)]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(session.state, PipelineState::Failed);
    assert_eq!(session.summary, "1 of 2 produced");
    // What did validate is still delivered.
    assert!(session.artifacts.files.contains_key("index.html"));
}

#[tokio::test]
async fn failed_foundation_skips_pages() {
    let client = Arc::new(SiteClient {
        fail_foundation: true,
        ..SiteClient::default()
    });
    let session = coordinator(client.clone(), listings())
        .run(&brief(&[("about.html", true)]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(session.state, PipelineState::Failed);
    let foundation = session.task("foundation").unwrap();
    assert_eq!(foundation.status, TaskStatus::Failed);
    assert_eq!(session.task("about.html").unwrap().status, TaskStatus::NotAttempted);
    assert!(session.artifacts.is_empty());
    assert!(client
        .prompts
        .lock()
        .unwrap()
        .iter()
        .all(|(_, p)| page_path(p).is_none()));
}

#[tokio::test]
async fn unavailable_catalog_is_an_error() {
    let source = listings();
    source.set_failing(true);
    let result = coordinator(Arc::new(SiteClient::default()), source)
        .run(&brief(&[("about.html", true)]), &CancellationToken::new())
        .await;
    let err = result.unwrap_err();
    assert!(matches!(err, PipelineError::Catalog(_)));
    assert_eq!(err.failure_kind(), Some(FailureKind::CatalogUnavailable));
}

#[tokio::test]
async fn cancelled_run_reports_not_attempted() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let session = coordinator(Arc::new(SiteClient::default()), listings())
        .run(&brief(&[("about.html", true)]), &cancel)
        .await
        .unwrap();

    assert!(session.cancelled);
    assert!(!session.timed_out);
    assert_eq!(session.state, PipelineState::Failed);
    assert_eq!(session.task("foundation").unwrap().status, TaskStatus::NotAttempted);
}

#[tokio::test]
async fn literal_colors_are_sanitized_into_root() {
    let client = Arc::new(SiteClient {
        literal_colors: true,
        ..SiteClient::default()
    });
    let session = coordinator(client, listings())
        .run(&brief(&[("about.html", true)]), &CancellationToken::new())
        .await
        .unwrap();

    assert!(session.is_done());
    let css = &session.artifacts.files["styles.css"];
    assert!(css.contains("var(--color-auto-1)"), "{css}");
    assert!(css.contains("--color-auto-1: #ff0000"), "{css}");
    assert!(!css.contains("color: #ff0000"), "{css}");
    let foundation = session.task("foundation").unwrap();
    assert!(foundation.issues.is_empty(), "{:?}", foundation.issues);
}

#[tokio::test]
async fn page_colors_join_the_shared_stylesheet() {
    let client = Arc::new(SiteClient {
        literal_colors: true,
        page_literal_colors: true,
        ..SiteClient::default()
    });
    let session = coordinator(client, listings())
        .run(&brief(&[("about.html", true)]), &CancellationToken::new())
        .await
        .unwrap();

    assert!(session.is_done());
    let css = &session.artifacts.files["styles.css"];
    let page = &session.artifacts.files["about.html"];
    assert!(css.contains("--color-auto-1: #000000;"), "{css}");
    assert!(css.contains("--color-auto-2: #ff0000;"), "{css}");
    assert!(page.contains(".note { color: var(--color-auto-1); }"), "{page}");
    assert!(!page.contains(":root"), "{page}");
    assert!(pagesmith::artifact::styles::scan_files(&session.artifacts.files).is_empty());
    assert!(session.tasks.iter().all(|t| t.issues.is_empty()), "{:?}", session.tasks);
}
