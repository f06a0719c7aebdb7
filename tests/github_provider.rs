use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};

use changelog_gateway::cache::{MemoryCacheStore, MemoryLockStore};
use changelog_gateway::provider::StaticCredentials;
use changelog_gateway::security::{static_resolver, UrlPolicy};
use changelog_gateway::{ChangelogGateway, FetchOutcome, ProviderContext, SettingsMap};

#[derive(Default)]
struct Recorded {
    queries: Vec<HashMap<String, String>>,
    auth: Vec<Option<String>>,
}

type Shared = Arc<Mutex<Recorded>>;

fn api_commit(n: u32, message: &str, parents: usize) -> Value {
    json!({
        "sha": format!("{:040x}", n),
        "html_url": format!("https://github.com/acme/site/commit/{:040x}", n),
        "commit": {
            "message": message,
            "author": {"name": "Ada", "email": "ada@example.com", "date": "2024-05-01T09:00:00Z"},
            "committer": {"name": "GitHub", "email": "noreply@github.com", "date": "2024-05-01T10:00:00Z"}
        },
        "parents": (0..parents).map(|i| json!({"sha": format!("{:040x}", 1000 + i)})).collect::<Vec<_>>()
    })
}

async fn commits(
    State(recorded): State<Shared>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    {
        let mut r = recorded.lock().unwrap();
        r.queries.push(query.clone());
        r.auth.push(
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );
    }

    match (owner.as_str(), repo.as_str()) {
        ("acme", "site") => {
            let page: u32 = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
            if page == 1 {
                let body = json!([
                    api_commit(1, "Add changelog page\n\nRenders commit history.", 1),
                    api_commit(2, "Merge pull request #4 from acme/feature", 2),
                    api_commit(3, "Fix typo", 1),
                ]);
                (
                    [(header::LINK, r#"<https://api.github.com/repositories/1/commits?page=2>; rel="next""#)],
                    Json(body),
                )
                    .into_response()
            } else {
                Json(json!([api_commit(4, "Initial commit", 0)])).into_response()
            }
        }
        ("acme", "limited") => (
            StatusCode::FORBIDDEN,
            [("x-ratelimit-remaining", "0")],
            Json(json!({"message": "API rate limit exceeded"})),
        )
            .into_response(),
        ("acme", "garbage") => "<html>not json</html>".into_response(),
        ("acme", "moved") => (
            StatusCode::FOUND,
            [(header::LOCATION, "http://169.254.169.254/latest/meta-data")],
        )
            .into_response(),
        _ => (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"}))).into_response(),
    }
}

async fn spawn_api() -> (u16, Shared) {
    let recorded: Shared = Arc::default();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = Router::new()
        .route("/repos/{owner}/{repo}/commits", get(commits))
        .with_state(recorded.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, recorded)
}

fn context() -> ProviderContext {
    let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
    ProviderContext {
        credentials: Arc::new(StaticCredentials(HashMap::from([(
            "GITHUB_TOKEN".to_string(),
            "ghp_test".to_string(),
        )]))),
        url_policy: UrlPolicy::allowlist(["api.test"])
            .with_schemes(["http"])
            .with_private_ips(true)
            .with_resolver(static_resolver([("api.test", vec![local])])),
        ..ProviderContext::default()
    }
}

fn gateway() -> ChangelogGateway {
    ChangelogGateway::new(
        Arc::new(MemoryCacheStore::default()),
        Arc::new(MemoryLockStore::new()),
        context(),
    )
}

fn settings(port: u16, repo: &str, extra: Value) -> SettingsMap {
    let mut map = json!({
        "source_type": "github",
        "github_owner": "acme",
        "github_repo": repo,
        "github_api_base_url": format!("http://api.test:{}", port),
        "per_page": 3,
    })
    .as_object()
    .cloned()
    .unwrap();
    if let Value::Object(extra) = extra {
        map.extend(extra);
    }
    map
}

#[tokio::test]
async fn maps_commits_and_pagination() {
    let (port, recorded) = spawn_api().await;
    let gw = gateway();
    let s = settings(port, "site", json!({"branch": "release"}));

    let page = gw.fetch_page(&s, 1, false, &HashMap::new()).await.unwrap();
    assert!(page.has_more);
    assert_eq!(page.page, 1);
    assert_eq!(page.per_page, 3);
    // Merge commit dropped client-side.
    assert_eq!(page.len(), 2);
    let first = &page.commits[0];
    assert_eq!(first.title, "Add changelog page");
    assert_eq!(first.body, "Renders commit history.");
    assert_eq!(first.short_sha, &first.sha[..7]);
    assert_eq!(first.author_name, "Ada");
    assert_eq!(first.committed_at, "2024-05-01T10:00:00Z");
    assert!(first.url.as_deref().unwrap().starts_with("https://github.com/acme/site/commit/"));

    let r = recorded.lock().unwrap();
    let q = &r.queries[0];
    assert_eq!(q.get("sha").map(String::as_str), Some("release"));
    assert_eq!(q.get("per_page").map(String::as_str), Some("3"));
    assert_eq!(q.get("page").map(String::as_str), Some("1"));
    assert_eq!(r.auth[0].as_deref(), Some("Bearer ghp_test"));
}

#[tokio::test]
async fn last_page_without_link_has_no_more() {
    let (port, _) = spawn_api().await;
    let page = gateway()
        .fetch_page(&settings(port, "site", json!({})), 2, false, &HashMap::new())
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert!(!page.has_more);
}

#[tokio::test]
async fn merges_and_search_follow_the_request() {
    let (port, _) = spawn_api().await;
    let gw = gateway();
    let s = settings(port, "site", json!({}));

    let with_merges = gw.fetch_page(&s, 1, true, &HashMap::new()).await.unwrap();
    assert_eq!(with_merges.len(), 3);

    let search = HashMap::from([("search".to_string(), "TYPO".to_string())]);
    let found = gw.fetch_page(&s, 1, true, &search).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.commits[0].title, "Fix typo");
}

#[tokio::test]
async fn filters_are_forwarded_as_query_parameters() {
    let (port, recorded) = spawn_api().await;
    let filters = HashMap::from([
        ("author".to_string(), "ada".to_string()),
        ("path".to_string(), "docs/".to_string()),
        ("since".to_string(), "2024-04-01".to_string()),
    ]);
    gateway()
        .fetch_page(&settings(port, "site", json!({})), 1, false, &filters)
        .await
        .unwrap();

    let r = recorded.lock().unwrap();
    let q = &r.queries[0];
    assert_eq!(q.get("author").map(String::as_str), Some("ada"));
    assert_eq!(q.get("path").map(String::as_str), Some("docs/"));
    assert!(q.get("since").unwrap().starts_with("2024-04-01T00:00:00"));
    assert!(!q.contains_key("search"));
}

#[tokio::test]
async fn token_mode_none_sends_no_credentials() {
    let (port, recorded) = spawn_api().await;
    gateway()
        .fetch_page(
            &settings(port, "site", json!({"github_token_mode": "none"})),
            1,
            false,
            &HashMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(recorded.lock().unwrap().auth[0], None);
}

#[tokio::test]
async fn upstream_failures_are_typed() {
    let (port, _) = spawn_api().await;
    let gw = gateway();

    let err = gw
        .fetch_page(&settings(port, "limited", json!({})), 1, false, &HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "upstream");
    let message = err.to_string();
    assert!(message.contains("rate limited"), "{}", message);
    assert!(message.contains("API rate limit exceeded"), "{}", message);

    let err = gw
        .fetch_page(&settings(port, "garbage", json!({})), 1, false, &HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "upstream");

    let err = gw
        .fetch_page(&settings(port, "missing", json!({})), 1, false, &HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "upstream");
}

#[tokio::test]
async fn redirect_to_internal_address_is_a_security_error() {
    let (port, _) = spawn_api().await;
    let gw = gateway();
    let s = settings(port, "moved", json!({}));

    let err = gw.fetch_page(&s, 1, false, &HashMap::new()).await.unwrap_err();
    assert_eq!(err.kind(), "security");

    let check = gw.test_source(&s).await;
    assert!(!check.ok);
    assert_eq!(check.error_kind, Some("security"));
}

#[tokio::test]
async fn api_host_outside_policy_is_refused() {
    let (port, _) = spawn_api().await;
    let mut ctx = context();
    ctx.url_policy = ctx.url_policy.clone().with_private_ips(false);
    let gw = ChangelogGateway::new(
        Arc::new(MemoryCacheStore::default()),
        Arc::new(MemoryLockStore::new()),
        ctx,
    );
    let err = gw
        .fetch_page(&settings(port, "site", json!({})), 1, false, &HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "security");
}

#[tokio::test]
async fn cached_pages_skip_the_api() {
    let (port, recorded) = spawn_api().await;
    let gw = gateway();
    let s = settings(port, "site", json!({}));

    gw.fetch_page(&s, 1, false, &HashMap::new()).await.unwrap();
    let (_, outcome) = gw.fetch_page_with_outcome(&s, 1, false, &HashMap::new()).await.unwrap();
    assert_eq!(outcome, FetchOutcome::Hit);
    assert_eq!(recorded.lock().unwrap().queries.len(), 1);
}
