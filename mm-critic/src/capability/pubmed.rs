use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{CapabilityError, CapabilityResult, LiteratureSearch, RetryPolicy, with_retry};
use crate::models::LiteratureArticle;

const EUTILS_BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

/// Publication types worth citing in a case review.
const EVIDENCE_FILTER: &str =
    "(guideline[pt] OR systematic review[pt] OR meta-analysis[pt] OR clinical trial[pt])";

/// [`LiteratureSearch`] over NCBI E-utilities.
pub struct PubMedClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl PubMedClient {
    pub fn new(retry: RetryPolicy) -> Self {
        Self::with_base_url(EUTILS_BASE_URL, retry)
    }

    pub fn with_base_url(base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            retry,
        }
    }

    async fn search_ids(&self, term: &str, max_results: usize) -> CapabilityResult<Vec<String>> {
        let url = format!(
            "{}/esearch.fcgi?db=pubmed&term={}&retmax={}&retmode=json&sort=relevance",
            self.base_url,
            urlencoding::encode(term),
            max_results
        );

        let data: Value = with_retry(&self.retry, "pubmed.esearch", || {
            let url = url.as_str();
            async move {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| CapabilityError::Transport(format!("PubMed search request failed: {e}")))?;
                response
                    .json::<Value>()
                    .await
                    .map_err(|e| CapabilityError::Malformed(format!("PubMed search response: {e}")))
            }
        })
        .await?;

        let ids = data["esearchresult"]["idlist"]
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    async fn fetch_articles(&self, pmids: &[String]) -> CapabilityResult<Vec<LiteratureArticle>> {
        let url = format!(
            "{}/efetch.fcgi?db=pubmed&id={}&retmode=xml",
            self.base_url,
            pmids.join(",")
        );

        let xml = with_retry(&self.retry, "pubmed.efetch", || {
            let url = url.as_str();
            async move {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| CapabilityError::Transport(format!("PubMed fetch request failed: {e}")))?;
                response
                    .text()
                    .await
                    .map_err(|e| CapabilityError::Transport(format!("PubMed fetch body: {e}")))
            }
        })
        .await?;

        Ok(parse_pubmed_xml(&xml))
    }
}

#[async_trait]
impl LiteratureSearch for PubMedClient {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> CapabilityResult<Vec<LiteratureArticle>> {
        let filtered = format!("({query}) AND {EVIDENCE_FILTER}");
        let mut pmids = self.search_ids(&filtered, max_results).await?;

        if pmids.is_empty() {
            info!(query = %query, "No filtered PubMed hits, retrying without publication type filter");
            pmids = self.search_ids(query, max_results).await?;
        }

        if pmids.is_empty() {
            warn!(query = %query, "PubMed search returned no articles");
            return Ok(Vec::new());
        }

        let mut articles = self.fetch_articles(&pmids).await?;
        articles.truncate(max_results);
        info!(query = %query, count = articles.len(), "PubMed articles fetched");
        Ok(articles)
    }
}

fn parse_pubmed_xml(xml: &str) -> Vec<LiteratureArticle> {
    xml.split("<PubmedArticle>")
        .skip(1)
        .filter_map(|section| {
            let source_id = extract_xml_value(section, "<PMID")?;
            Some(LiteratureArticle {
                source_id,
                title: extract_xml_value(section, "<ArticleTitle>").unwrap_or_default(),
                abstract_text: extract_abstract(section),
                journal: extract_xml_value(section, "<Title>"),
            })
        })
        .collect()
}

/// Structured abstracts carry several `AbstractText` sections; join them all.
fn extract_abstract(section: &str) -> String {
    let mut parts = Vec::new();
    let mut rest = section;
    while let Some(start) = rest.find("<AbstractText") {
        let after = &rest[start..];
        let Some(open_end) = after.find('>') else { break };
        let body = &after[open_end + 1..];
        let Some(close) = body.find("</AbstractText>") else { break };
        parts.push(body[..close].trim().to_string());
        rest = &body[close..];
    }
    parts.join(" ")
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let name = tag.trim_start_matches('<').trim_end_matches('>');
    let name = name.split_whitespace().next()?;
    let start = xml.find(&format!("<{name}"))?;
    let content_start = xml[start..].find('>')? + start + 1;
    let end = xml[content_start..].find(&format!("</{name}>"))?;
    Some(xml[content_start..content_start + end].trim().to_string())
}
