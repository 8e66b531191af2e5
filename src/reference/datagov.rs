use std::time::Duration;

use anyhow::bail;
use log::debug;
use reqwest::{header::CONTENT_TYPE, Client};
use serde::Deserialize;
use serde_json::{Map, Value};

pub static DATAGOV_DOWNLOAD_API: &str = "https://api-open.data.gov.sg/v1/public/api";
pub static DATAGOV_ROWS_API: &str = "https://api-production.data.gov.sg/v2/public/api";

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    #[serde(default)]
    data: Option<DownloadData>,
}

#[derive(Debug, Deserialize)]
struct DownloadData {
    #[serde(default)]
    url: Option<String>,
}

/// The download URL if the response says the export is ready.
fn ready_url(body: &str) -> Result<Option<String>, anyhow::Error> {
    let response: DownloadResponse = serde_json::from_str(body)?;
    Ok(response
        .data
        .and_then(|data| data.url)
        .filter(|url| !url.trim().is_empty()))
}

/// One call to the export API: `initiate-download` or `poll-download`.
#[allow(async_fn_in_trait)]
pub trait ExportStatus {
    /// `Ok(Some(url))` once the export is ready.
    async fn check(&self, dataset_id: &str, action: &str) -> Result<Option<String>, anyhow::Error>;
}

/// Asks for an export and polls until a download URL is available. Polls are
/// `poll_delay` apart; still not ready after `poll_retries` polls is an error.
pub async fn wait_for_url<A: ExportStatus>(
    api: &A,
    dataset_id: &str,
    poll_retries: usize,
    poll_delay: Duration,
) -> Result<String, anyhow::Error> {
    if let Some(url) = api.check(dataset_id, "initiate-download").await? {
        return Ok(url);
    }
    for poll in 1..=poll_retries {
        if let Some(url) = api.check(dataset_id, "poll-download").await? {
            debug!("Dataset {} ready after {} polls", dataset_id, poll);
            return Ok(url);
        }
        if poll < poll_retries {
            tokio::time::sleep(poll_delay).await;
        }
    }
    bail!("dataset {} not ready after {} polls", dataset_id, poll_retries)
}

pub struct DatasetDownload<'a> {
    pub client: &'a Client,
    pub api_base: &'a str,
    pub api_key: Option<&'a str>,
    pub poll_retries: usize,
    pub poll_delay: Duration,
}

impl ExportStatus for DatasetDownload<'_> {
    async fn check(&self, dataset_id: &str, action: &str) -> Result<Option<String>, anyhow::Error> {
        let mut request = self
            .client
            .get(format!("{}/datasets/{}/{}", self.api_base, dataset_id, action))
            .header(CONTENT_TYPE, "application/json")
            .body("{}");
        if let Some(api_key) = self.api_key {
            request = request.header("x-api-key", api_key);
        }
        let body = request.send().await?.error_for_status()?.text().await?;
        ready_url(&body)
    }
}

impl DatasetDownload<'_> {
    /// Fetches the exported document as text.
    pub async fn fetch(&self, dataset_id: &str) -> Result<String, anyhow::Error> {
        let url = wait_for_url(self, dataset_id, self.poll_retries, self.poll_delay).await?;
        debug!("Downloading dataset {} from {}", dataset_id, url);
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }
}

#[derive(Debug, Deserialize)]
struct RowsResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    data: Option<RowsData>,
}

#[derive(Debug, Deserialize)]
struct RowsData {
    #[serde(default)]
    rows: Vec<Value>,
    #[serde(default)]
    links: Option<RowsLinks>,
}

#[derive(Debug, Deserialize)]
struct RowsLinks {
    #[serde(default)]
    next: Option<String>,
}

/// A list-rows page: its rows, flattened to objects, and the next page link.
fn rows_page(body: &str) -> Result<(Vec<Map<String, Value>>, Option<String>), anyhow::Error> {
    let response: RowsResponse = serde_json::from_str(body)?;
    if response.code != Some(1) {
        bail!("list-rows answered with code {:?}", response.code);
    }
    let Some(data) = response.data else {
        return Ok((Vec::new(), None));
    };
    let rows = data
        .rows
        .into_iter()
        .filter_map(|row| match row {
            Value::Object(mut object) => match object.remove("row") {
                Some(Value::Object(inner)) if object.is_empty() => Some(inner),
                Some(other) => {
                    object.insert("row".to_string(), other);
                    Some(object)
                }
                None => Some(object),
            },
            _ => None,
        })
        .collect();
    let next = data
        .links
        .and_then(|links| links.next)
        .filter(|next| !next.trim().is_empty());
    Ok((rows, next))
}

/// Fetches one list-rows page body. The first page is addressed by dataset,
/// later pages by the absolute `links.next` URL.
#[allow(async_fn_in_trait)]
pub trait RowPages {
    async fn first(&self, dataset_id: &str) -> Result<String, anyhow::Error>;
    async fn next(&self, url: &str) -> Result<String, anyhow::Error>;
}

pub struct RowListing<'a> {
    pub client: &'a Client,
    pub api_base: &'a str,
    pub api_key: Option<&'a str>,
    pub page_limit: usize,
}

impl RowListing<'_> {
    async fn get(&self, request: reqwest::RequestBuilder) -> Result<String, anyhow::Error> {
        let request = match self.api_key {
            Some(api_key) => request.header("x-api-key", api_key),
            None => request,
        };
        Ok(request.send().await?.error_for_status()?.text().await?)
    }
}

impl RowPages for RowListing<'_> {
    async fn first(&self, dataset_id: &str) -> Result<String, anyhow::Error> {
        let request = self
            .client
            .get(format!("{}/datasets/{}/list-rows", self.api_base, dataset_id))
            .query(&[("limit", self.page_limit.to_string())]);
        self.get(request).await
    }

    async fn next(&self, url: &str) -> Result<String, anyhow::Error> {
        self.get(self.client.get(url)).await
    }
}

/// Follows `links.next` until a page is empty or has no successor.
pub async fn list_rows<P: RowPages>(
    pages: &P,
    dataset_id: &str,
) -> Result<Vec<Map<String, Value>>, anyhow::Error> {
    let (mut rows, mut next) = rows_page(&pages.first(dataset_id).await?)?;
    let mut visited = Vec::new();
    while let Some(url) = next.take() {
        if visited.contains(&url) {
            debug!("list-rows link {} repeats, stopping", url);
            break;
        }
        let (page, following) = rows_page(&pages.next(&url).await?)?;
        visited.push(url);
        if page.is_empty() {
            break;
        }
        rows.extend(page);
        next = following;
    }
    debug!("list-rows returned {} rows for {}", rows.len(), dataset_id);
    Ok(rows)
}

#[cfg(test)]
mod test {
    use std::{
        cell::RefCell,
        collections::{HashMap, VecDeque},
        time::{Duration, Instant},
    };

    use serde_json::json;

    use super::{list_rows, ready_url, rows_page, wait_for_url, ExportStatus, RowPages};

    /// Answers export checks from a queue; an exhausted queue means "not ready".
    struct ScriptedExport {
        answers: RefCell<VecDeque<Option<String>>>,
        actions: RefCell<Vec<String>>,
    }

    impl ScriptedExport {
        fn new(answers: Vec<Option<&str>>) -> ScriptedExport {
            ScriptedExport {
                answers: RefCell::new(answers.into_iter().map(|a| a.map(str::to_string)).collect()),
                actions: RefCell::new(Vec::new()),
            }
        }
    }

    impl ExportStatus for ScriptedExport {
        async fn check(&self, _dataset_id: &str, action: &str) -> Result<Option<String>, anyhow::Error> {
            self.actions.borrow_mut().push(action.to_string());
            Ok(self.answers.borrow_mut().pop_front().flatten())
        }
    }

    struct ScriptedPages {
        first: String,
        by_url: HashMap<String, String>,
    }

    impl RowPages for ScriptedPages {
        async fn first(&self, _dataset_id: &str) -> Result<String, anyhow::Error> {
            Ok(self.first.clone())
        }

        async fn next(&self, url: &str) -> Result<String, anyhow::Error> {
            match self.by_url.get(url) {
                Some(body) => Ok(body.clone()),
                None => anyhow::bail!("404 for {url}"),
            }
        }
    }

    #[test]
    fn test_ready_url() {
        assert_eq!(
            ready_url(r#"{"code":0,"data":{"status":"DOWNLOAD_SUCCESS","url":"https://s3/x.geojson"}}"#)
                .unwrap()
                .as_deref(),
            Some("https://s3/x.geojson")
        );
        assert_eq!(
            ready_url(r#"{"code":0,"data":{"message":"Download initiated"}}"#).unwrap(),
            None
        );
        assert_eq!(ready_url(r#"{"code":0,"data":{"url":""}}"#).unwrap(), None);
        assert_eq!(ready_url(r#"{"code":24,"errorMsg":"not found"}"#).unwrap(), None);
        assert!(ready_url("Service Unavailable").is_err());
    }

    #[tokio::test]
    async fn test_ready_on_third_poll() {
        let api = ScriptedExport::new(vec![None, None, None, Some("https://s3/schools.csv")]);
        let url = wait_for_url(&api, "d_1", 5, Duration::ZERO).await.unwrap();
        assert_eq!(url, "https://s3/schools.csv");
        assert_eq!(
            *api.actions.borrow(),
            vec!["initiate-download", "poll-download", "poll-download", "poll-download"]
        );
    }

    #[tokio::test]
    async fn test_ready_at_initiate() {
        let api = ScriptedExport::new(vec![Some("https://s3/now.csv")]);
        assert_eq!(wait_for_url(&api, "d_1", 5, Duration::ZERO).await.unwrap(), "https://s3/now.csv");
        assert_eq!(api.actions.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_never_ready_fails_after_retries() {
        let api = ScriptedExport::new(vec![]);
        assert!(wait_for_url(&api, "d_1", 3, Duration::ZERO).await.is_err());
        assert_eq!(api.actions.borrow().len(), 4);
    }

    #[tokio::test]
    async fn test_no_sleep_after_final_poll() {
        let api = ScriptedExport::new(vec![]);
        let started = Instant::now();
        assert!(wait_for_url(&api, "d_1", 1, Duration::from_secs(5)).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_rows_page() {
        let body = json!({
            "code": 1,
            "data": {
                "rows": [
                    {"school_name": "A", "postal_code": "1"},
                    {"row": {"school_name": "B"}},
                    "garbage"
                ],
                "links": {"next": "https://api/next?page=2"}
            }
        })
        .to_string();
        let (rows, next) = rows_page(&body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["school_name"], "B");
        assert_eq!(next.as_deref(), Some("https://api/next?page=2"));
        assert!(rows_page(r#"{"code":0,"errorMsg":"bad key"}"#).is_err());
    }

    #[tokio::test]
    async fn test_list_rows_follows_next_links() {
        let page = |name: &str, next: Option<&str>| {
            json!({"code": 1, "data": {"rows": [{"school_name": name}], "links": {"next": next}}}).to_string()
        };
        let pages = ScriptedPages {
            first: page("A", Some("https://api/p2")),
            by_url: HashMap::from([
                ("https://api/p2".to_string(), page("B", Some("https://api/p3"))),
                ("https://api/p3".to_string(), page("C", Some("https://api/p2"))),
            ]),
        };
        let rows = list_rows(&pages, "d_1").await.unwrap();
        let names: Vec<_> = rows.iter().map(|row| row["school_name"].as_str()).collect();
        assert_eq!(names, vec![Some("A"), Some("B"), Some("C")]);
    }

    #[tokio::test]
    async fn test_list_rows_propagates_page_errors() {
        let pages = ScriptedPages {
            first: json!({"code": 1, "data": {"rows": [{"a": 1}], "links": {"next": "https://api/gone"}}})
                .to_string(),
            by_url: HashMap::new(),
        };
        assert!(list_rows(&pages, "d_1").await.is_err());
    }
}
