//! Prompt payloads for foundation and page generation.
//!
//! Backend-agnostic: the same payload is re-sent unchanged when a task is
//! substituted onto another backend.

use serde::{Deserialize, Serialize};

use crate::gateway::{Message, PromptPayload};

// =============================================================================
// Briefs
// =============================================================================

/// One page the site needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageBrief {
    /// Output path, e.g. `about.html`.
    pub path: String,
    #[serde(default)]
    pub title: Option<String>,
    pub purpose: String,
    /// A required page failing fails the whole run.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// The high-level content request the pipeline turns into a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBrief {
    pub site_name: String,
    pub summary: String,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub pages: Vec<PageBrief>,
}

/// What page tasks need to know about the foundation they slot into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedChrome {
    pub entry: String,
    pub stylesheets: Vec<String>,
    /// Custom property names declared in `:root`, without the `--`.
    pub custom_properties: Vec<String>,
}

// =============================================================================
// Rendering
// =============================================================================

/// Escape XML special characters so brief text cannot break out of its tags.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

const OUTPUT_CONTRACT: &str = r#"Respond with a single JSON object and nothing else:
{"files": {"<path>": "<content>", ...}, "entry": "<path of the main file>", "notes": "<optional>"}"#;

const FOUNDATION_SYSTEM: &str = r#"You build the foundation of a small static website: the entry page with the shared header and footer, and one stylesheet.
Declare every color once as a custom property inside `:root { ... }` and refer to colors only through `var(--name)` elsewhere."#;

const PAGE_SYSTEM: &str = r#"You write the body region of one page of an existing static website.
The shared header, footer and document wrapper already exist. Do not emit <!doctype>, <html>, <head>, <body>, <header> or <footer>.
Use the site's custom properties for colors, never literal color values."#;

fn brief_block(brief: &ContentBrief) -> String {
    let mut parts = vec![
        format!("<site_name>{}</site_name>", escape_xml_chars(&brief.site_name)),
        format!("<summary>\n{}\n</summary>", escape_xml_chars(brief.summary.trim())),
    ];
    if let Some(a) = &brief.audience {
        parts.push(format!("<audience>{}</audience>", escape_xml_chars(a)));
    }
    if let Some(t) = &brief.tone {
        parts.push(format!("<tone>{}</tone>", escape_xml_chars(t)));
    }
    parts.join("\n")
}

pub fn foundation_payload(brief: &ContentBrief) -> PromptPayload {
    let page_list = brief
        .pages
        .iter()
        .map(|p| format!("- {} ({})", p.path, escape_xml_chars(&p.purpose)))
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!(
        "{}\n\n<navigation>\n{}\n</navigation>\n\n{}",
        brief_block(brief),
        page_list,
        OUTPUT_CONTRACT
    );
    PromptPayload::new(vec![Message::system(FOUNDATION_SYSTEM), Message::user(user)]).json()
}

pub fn page_payload(brief: &ContentBrief, page: &PageBrief, chrome: &SharedChrome) -> PromptPayload {
    let title = page.title.as_deref().unwrap_or(&page.path);
    let props = chrome
        .custom_properties
        .iter()
        .map(|p| format!("--{p}"))
        .collect::<Vec<_>>()
        .join(", ");
    let user = format!(
        "{}\n\n<shared_chrome>\nentry: {}\nstylesheets: {}\ncustom properties: {}\n</shared_chrome>\n\n\
         <page path=\"{}\">\n<title>{}</title>\n<purpose>{}</purpose>\n</page>\n\n\
         Put the body markup in \"{}\" and name it as the entry.\n{}",
        brief_block(brief),
        chrome.entry,
        chrome.stylesheets.join(", "),
        props,
        escape_xml_chars(&page.path),
        escape_xml_chars(title),
        escape_xml_chars(&page.purpose),
        page.path,
        OUTPUT_CONTRACT
    );
    PromptPayload::new(vec![Message::system(PAGE_SYSTEM), Message::user(user)]).json()
}

/// The original payload plus the validation errors the previous output hit.
pub fn escalation_payload(original: &PromptPayload, problems: &str) -> PromptPayload {
    let mut payload = original.clone();
    payload.messages.push(Message::user(format!(
        "A previous answer to this request was rejected: {}\nFix these problems and answer again.\n{}",
        escape_xml_chars(problems),
        OUTPUT_CONTRACT
    )));
    payload
}
