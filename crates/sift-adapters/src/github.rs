//! GitHub backend
//!
//! REST for comments, replies and issues; GraphQL for minimizing comments.
//! Every failure is translated into `IngestError` / `SyncError` here so the
//! engine never sees a raw HTTP error.

use crate::keyring;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, LINK};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sift_core::{
    BackendFuture, CollaborationBackend, Comment, IngestError, Location, MinimizeReason,
    PullRequestRef, SyncError, ThreadKind,
};
use std::time::Duration;

const API_TIMEOUT_SECS: u64 = 60;
const PER_PAGE: u32 = 100;
/// Pages fetched before a listing that keeps going is rejected.
const MAX_PAGES: usize = 50;
const USER_AGENT: &str = concat!("sift/", env!("CARGO_PKG_VERSION"));
/// Hidden marker on every reply sift posts, so re-ingestion can skip them.
pub const REPLY_MARKER: &str = "<!-- sift:reply -->";
const DISCUSSION_ID_PREFIX: &str = "issue-";
const MAX_ERROR_BODY_LEN: usize = 200;
const MAX_QUOTE_LINES: usize = 3;

/// The GitHub token, or None if not authenticated. `GITHUB_TOKEN` wins.
pub fn get_stored_token() -> Option<String> {
    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        if !token.trim().is_empty() {
            return Some(token.trim().to_string());
        }
    }

    match keyring::get_github_token() {
        Ok(token) => token,
        Err(err) => {
            keyring::warn_keychain_error_once("GitHub token", &err);
            None
        }
    }
}

/// Truncate an error body and redact it entirely if it might carry a secret.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];

    let truncated = if body.chars().count() > MAX_ERROR_BODY_LEN {
        let head: String = body.chars().take(MAX_ERROR_BODY_LEN).collect();
        format!("{}... (truncated)", head)
    } else {
        body.to_string()
    };

    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(error details redacted - may contain sensitive data)".to_string();
    }
    truncated
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

/// Human-readable message from an error response body.
fn api_error_message(body: &str) -> String {
    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(body) {
        let detail = api_error
            .errors
            .first()
            .and_then(|e| e.message.clone())
            .unwrap_or_default();
        return if detail.is_empty() {
            api_error.message
        } else {
            format!("{}: {}", api_error.message, detail)
        };
    }
    sanitize_error_body(body)
}

// ── Wire payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UserPayload {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ReviewCommentPayload {
    id: u64,
    node_id: String,
    path: Option<String>,
    line: Option<u64>,
    start_line: Option<u64>,
    original_line: Option<u64>,
    original_start_line: Option<u64>,
    user: Option<UserPayload>,
    #[serde(default)]
    body: String,
    created_at: DateTime<Utc>,
    in_reply_to_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IssueCommentPayload {
    id: u64,
    node_id: String,
    user: Option<UserPayload>,
    #[serde(default)]
    body: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CreatedPayload {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct CreatedIssuePayload {
    number: u64,
}

#[derive(Serialize)]
struct BodyRequest<'a> {
    body: &'a str,
}

#[derive(Serialize)]
struct CreateIssueRequest<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

const MINIMIZE_MUTATION: &str = "mutation($id: ID!, $classifier: ReportedContentClassifiers!) { \
minimizeComment(input: {subjectId: $id, classifier: $classifier}) { minimizedComment { isMinimized } } }";

fn author_of(user: Option<UserPayload>) -> String {
    user.map(|u| u.login)
        .unwrap_or_else(|| "ghost".to_string())
}

fn to_line(value: Option<u64>) -> Option<usize> {
    value.and_then(|v| usize::try_from(v).ok()).filter(|v| *v > 0)
}

fn review_comment(payload: ReviewCommentPayload) -> Comment {
    // Outdated comments lose `line`; fall back to where they were left.
    let end = to_line(payload.line).or_else(|| to_line(payload.original_line));
    let start = to_line(payload.start_line)
        .or_else(|| to_line(payload.original_start_line))
        .or(end);
    let location = payload
        .path
        .filter(|p| !p.is_empty())
        .map(|path| Location::new(path, start, end));
    Comment {
        id: payload.id.to_string(),
        node_id: Some(payload.node_id),
        location,
        author: author_of(payload.user),
        body: payload.body,
        thread_kind: ThreadKind::ReviewComment,
        created_at: payload.created_at,
        resolved: false,
    }
}

fn discussion_comment(payload: IssueCommentPayload) -> Comment {
    Comment {
        id: format!("{}{}", DISCUSSION_ID_PREFIX, payload.id),
        node_id: Some(payload.node_id),
        location: None,
        author: author_of(payload.user),
        body: payload.body,
        thread_kind: ThreadKind::Discussion,
        created_at: payload.created_at,
        resolved: false,
    }
}

/// Top-level review remarks only: thread replies and sift's own replies
/// are dropped.
fn collect_comments(
    review: Vec<ReviewCommentPayload>,
    discussion: Vec<IssueCommentPayload>,
) -> Vec<Comment> {
    let review = review
        .into_iter()
        .filter(|c| c.in_reply_to_id.is_none())
        .map(review_comment);
    let discussion = discussion.into_iter().map(discussion_comment);
    let mut comments: Vec<Comment> = review
        .chain(discussion)
        .filter(|c| !c.body.contains(REPLY_MARKER))
        .collect();
    comments.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    comments
}

/// The numeric backend id behind a comment id.
fn numeric_id(comment: &Comment) -> Result<u64, SyncError> {
    let raw = comment
        .id
        .strip_prefix(DISCUSSION_ID_PREFIX)
        .unwrap_or(&comment.id);
    raw.parse::<u64>().map_err(|_| SyncError::Rejected {
        action: "reply",
        status: 0,
        message: format!("comment id '{}' is not a GitHub id", comment.id),
    })
}

/// Discussion comments have no threads, so replies quote the original.
fn quote_for_discussion(comment: &Comment, body: &str) -> String {
    let mut quoted: Vec<String> = comment
        .body
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(MAX_QUOTE_LINES)
        .map(|line| format!("> {}", line.trim()))
        .collect();
    if comment.body.lines().filter(|l| !l.trim().is_empty()).count() > MAX_QUOTE_LINES {
        quoted.push("> …".to_string());
    }
    format!("@{}\n{}\n\n{}", comment.author, quoted.join("\n"), body)
}

fn with_marker(body: &str) -> String {
    format!("{}\n\n{}", body.trim_end(), REPLY_MARKER)
}

/// `rel="next"` target from a `Link` header.
fn next_page_url(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    parse_next_link(link)
}

fn parse_next_link(link: &str) -> Option<String> {
    link.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let url = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        if !is_next {
            return None;
        }
        url.strip_prefix('<')
            .and_then(|u| u.strip_suffix('>'))
            .map(str::to_string)
    })
}

/// The next page to fetch after `pages_fetched` pages. A listing that
/// still continues at the page cap is an error: comments past it would be
/// silently missing from the run.
fn follow_next_page(
    pages_fetched: usize,
    next: Option<String>,
) -> Result<Option<String>, IngestError> {
    match next {
        Some(_) if pages_fetched >= MAX_PAGES => {
            tracing::warn!(pages = pages_fetched, "comment listing exceeds the page cap");
            Err(IngestError::TooManyPages {
                pages: pages_fetched,
            })
        }
        next => Ok(next),
    }
}

/// GraphQL endpoint for a REST base (`/api/v3` on Enterprise).
fn graphql_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    match base.strip_suffix("/v3") {
        Some(root) => format!("{}/graphql", root),
        None => format!("{}/graphql", base),
    }
}

pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    /// Client using the stored token (env first, then keychain).
    pub fn from_env(api_url: &str) -> Result<Self, String> {
        Self::new(api_url, get_stored_token())
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    fn repo_url(&self, pr: &PullRequestRef, tail: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_url, pr.owner, pr.repo, tail
        )
    }

    async fn fetch_all<T: DeserializeOwned>(&self, first_url: String) -> Result<Vec<T>, IngestError> {
        let mut url = Some(first_url);
        let mut out = Vec::new();
        let mut pages = 0;
        while let Some(current) = url.take() {
            let resp = self
                .request(Method::GET, &current)
                .send()
                .await
                .map_err(|e| IngestError::Unreachable {
                    message: e.to_string(),
                })?;
            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED {
                return Err(IngestError::NotAuthenticated);
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(IngestError::Rejected {
                    status: status.as_u16(),
                    message: api_error_message(&body),
                });
            }
            pages += 1;
            let next = next_page_url(resp.headers());
            let text = resp.text().await.map_err(|e| IngestError::Unreachable {
                message: e.to_string(),
            })?;
            let mut page: Vec<T> =
                serde_json::from_str(&text).map_err(|e| IngestError::MalformedPayload {
                    message: e.to_string(),
                })?;
            tracing::debug!(url = %current, count = page.len(), "fetched page");
            out.append(&mut page);
            url = follow_next_page(pages, next)?;
        }
        Ok(out)
    }

    /// Send a write request and decode the JSON response.
    async fn send_write<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        action: &'static str,
        method: Method,
        url: &str,
        body: &B,
    ) -> Result<T, SyncError> {
        if self.token.is_none() {
            return Err(SyncError::NotAuthenticated);
        }
        let resp = self
            .request(method, url)
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::Unreachable {
                message: e.to_string(),
            })?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::NotAuthenticated);
        }
        let text = resp.text().await.map_err(|e| SyncError::Unreachable {
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(SyncError::Rejected {
                action,
                status: status.as_u16(),
                message: api_error_message(&text),
            });
        }
        serde_json::from_str(&text).map_err(|e| SyncError::Rejected {
            action,
            status: status.as_u16(),
            message: format!("unexpected response: {}", e),
        })
    }
}

impl CollaborationBackend for GitHubClient {
    fn fetch_comments<'a>(
        &'a self,
        pr: &'a PullRequestRef,
    ) -> BackendFuture<'a, Vec<Comment>, IngestError> {
        Box::pin(async move {
            let review: Vec<ReviewCommentPayload> = self
                .fetch_all(self.repo_url(
                    pr,
                    &format!("pulls/{}/comments?per_page={}", pr.number, PER_PAGE),
                ))
                .await?;
            let discussion: Vec<IssueCommentPayload> = self
                .fetch_all(self.repo_url(
                    pr,
                    &format!("issues/{}/comments?per_page={}", pr.number, PER_PAGE),
                ))
                .await?;
            let comments = collect_comments(review, discussion);
            tracing::info!(pr = %pr, comments = comments.len(), "fetched review comments");
            Ok(comments)
        })
    }

    fn post_reply<'a>(
        &'a self,
        pr: &'a PullRequestRef,
        comment: &'a Comment,
        body: &'a str,
    ) -> BackendFuture<'a, String, SyncError> {
        Box::pin(async move {
            let id = numeric_id(comment)?;
            let (url, text) = match comment.thread_kind {
                ThreadKind::ReviewComment => (
                    self.repo_url(pr, &format!("pulls/{}/comments/{}/replies", pr.number, id)),
                    with_marker(body),
                ),
                ThreadKind::Discussion => (
                    self.repo_url(pr, &format!("issues/{}/comments", pr.number)),
                    with_marker(&quote_for_discussion(comment, body)),
                ),
            };
            let created: CreatedPayload = self
                .send_write("reply", Method::POST, &url, &BodyRequest { body: &text })
                .await?;
            Ok(created.id.to_string())
        })
    }

    fn minimize_comment<'a>(
        &'a self,
        comment: &'a Comment,
        reason: MinimizeReason,
    ) -> BackendFuture<'a, (), SyncError> {
        Box::pin(async move {
            let node_id = comment
                .node_id
                .as_deref()
                .ok_or_else(|| SyncError::MissingNodeId {
                    comment_id: comment.id.clone(),
                })?;
            let request = GraphQlRequest {
                query: MINIMIZE_MUTATION,
                variables: serde_json::json!({
                    "id": node_id,
                    "classifier": reason.classifier(),
                }),
            };
            let response: GraphQlResponse = self
                .send_write(
                    "minimize",
                    Method::POST,
                    &graphql_url(&self.api_url),
                    &request,
                )
                .await?;
            if let Some(err) = response.errors.first() {
                return Err(SyncError::Rejected {
                    action: "minimize",
                    status: 200,
                    message: sanitize_error_body(&err.message),
                });
            }
            Ok(())
        })
    }

    fn create_issue<'a>(
        &'a self,
        pr: &'a PullRequestRef,
        title: &'a str,
        body: &'a str,
    ) -> BackendFuture<'a, String, SyncError> {
        Box::pin(async move {
            let created: CreatedIssuePayload = self
                .send_write(
                    "create issue",
                    Method::POST,
                    &self.repo_url(pr, "issues"),
                    &CreateIssueRequest { title, body },
                )
                .await?;
            Ok(format!("#{}", created.number))
        })
    }
}
