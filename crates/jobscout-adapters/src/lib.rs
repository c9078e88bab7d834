//! Job board adapter contracts + the LinkedIn guest API implementation.

use std::sync::Arc;

use async_trait::async_trait;
use jobscout_core::{Company, Country, EmploymentType, Job, JobDetails, Location, ParseError, SearchQuery};
use jobscout_http::{FetchError, PageFetcher, PageRequest};
use scraper::{ElementRef, Html, Selector};
use tracing::warn;
use url::Url;

pub const CRATE_NAME: &str = "jobscout-adapters";

/// A paginated job board: how to ask it for pages and how to read them.
#[async_trait]
pub trait JobBoard: Send + Sync {
    fn board_id(&self) -> &'static str;

    /// Records per listing page; offsets advance by this much.
    fn page_size(&self) -> usize;

    /// Largest offset the board accepts, exclusive.
    fn start_limit(&self) -> usize;

    fn listing_request(&self, query: &SearchQuery, offset: usize) -> PageRequest;

    fn parse_listing(&self, markup: &str) -> Result<Vec<Job>, ParseError>;

    fn detail_request(&self, query: &SearchQuery, job: &Job) -> PageRequest;

    fn parse_detail(&self, markup: &str) -> Result<JobDetails, ParseError>;

    async fn fetch_listing(
        &self,
        http: &PageFetcher,
        query: &SearchQuery,
        offset: usize,
    ) -> Result<Vec<Job>, FetchError> {
        let request = self.listing_request(query, offset);
        http.fetch(&request, |markup| self.parse_listing(markup)).await
    }

    async fn fetch_detail(
        &self,
        http: &PageFetcher,
        query: &SearchQuery,
        job: &Job,
    ) -> Result<JobDetails, FetchError> {
        let request = self.detail_request(query, job);
        http.fetch(&request, |markup| self.parse_detail(markup)).await
    }
}

pub fn board_for_id(board_id: &str) -> Option<Arc<dyn JobBoard>> {
    match board_id {
        "linkedin" => Some(Arc::new(LinkedInBoard)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkedInBoard;

impl LinkedInBoard {
    pub const SEARCH_URL: &'static str =
        "https://www.linkedin.com/jobs-guest/jobs/api/seeMoreJobPostings/search";
    pub const JOB_URL: &'static str = "https://www.linkedin.com/jobs/view";
    pub const RESULTS_PER_PAGE: usize = 25;
    // The guest API rejects `start` past 1000.
    pub const START_LIMIT: usize = 1000;
    pub const DEFAULT_LOCALE: &'static str = "en_US";
}

fn locale(query: &SearchQuery) -> &str {
    query.locale.as_deref().unwrap_or(LinkedInBoard::DEFAULT_LOCALE)
}

#[async_trait]
impl JobBoard for LinkedInBoard {
    fn board_id(&self) -> &'static str {
        "linkedin"
    }

    fn page_size(&self) -> usize {
        Self::RESULTS_PER_PAGE
    }

    fn start_limit(&self) -> usize {
        Self::START_LIMIT
    }

    fn listing_request(&self, query: &SearchQuery, offset: usize) -> PageRequest {
        PageRequest::new(Self::SEARCH_URL)
            .param("keywords", &query.keywords)
            .param("location", &query.location)
            .param("pageNum", 0)
            .param("_l", locale(query))
            .param("start", offset)
            .param_opt("geoId", query.geo_id.as_deref())
            .param_opt("f_WT", query.workplace.as_deref())
            .param_opt("f_E", query.experience.as_deref())
            .param_opt("f_JT", query.job_type.as_deref())
    }

    fn parse_listing(&self, markup: &str) -> Result<Vec<Job>, ParseError> {
        parse_listing_page(markup)
    }

    fn detail_request(&self, query: &SearchQuery, job: &Job) -> PageRequest {
        PageRequest::new(&job.link).param("_l", locale(query))
    }

    fn parse_detail(&self, markup: &str) -> Result<JobDetails, ParseError> {
        parse_detail_page(markup)
    }
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::InvalidSelector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

/// Reduces a posting href to `<JOB_URL>/<id>`, dropping the slug, query
/// string and tracking fragment.
pub fn canonical_job_link(href: &str) -> Option<String> {
    let url = Url::parse(href)
        .or_else(|_| Url::parse(LinkedInBoard::JOB_URL).and_then(|base| base.join(href)))
        .ok()?;
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let job_id = segment.rsplit('-').next()?;
    if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(format!("{}/{}", LinkedInBoard::JOB_URL, job_id))
}

// Matches str.isupper(): at least one cased char and no lowercase ones.
fn is_all_uppercase(value: &str) -> bool {
    value.chars().any(char::is_uppercase) && !value.chars().any(char::is_lowercase)
}

/// Splits "city, region, country" from the right. An unrecognised last part
/// is kept as the city of a worldwide location.
pub fn parse_location(text: &str) -> Location {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    let mut city = None;
    let mut region = None;
    let mut country = Country::Worldwide;

    if let Some(last) = parts.last().filter(|p| !p.is_empty()) {
        let possible_country = last.to_lowercase();
        match Country::from_alias(&possible_country) {
            Ok(found) => country = found,
            Err(err) => {
                warn!(error = %err, "expected a country; keeping it as the city");
                city = Some(possible_country);
            }
        }
    }
    if parts.len() >= 2 {
        let raw = parts[parts.len() - 2];
        region = Some(if is_all_uppercase(raw) {
            raw.to_string()
        } else {
            raw.to_lowercase()
        });
    }
    if parts.len() >= 3 {
        city = Some(parts[parts.len() - 3].to_lowercase());
    }

    Location {
        country,
        city,
        region,
    }
}

struct ListingSelectors {
    card: Selector,
    title: Selector,
    company: Selector,
    location: Selector,
}

impl ListingSelectors {
    fn new() -> Result<Self, ParseError> {
        Ok(Self {
            card: selector("div.base-card")?,
            title: selector("a.base-card__full-link")?,
            company: selector("h4.base-search-card__subtitle a.hidden-nested-link")?,
            location: selector("span.job-search-card__location")?,
        })
    }
}

fn parse_card(card: ElementRef<'_>, selectors: &ListingSelectors) -> Result<Job, ParseError> {
    let title_section = card
        .select(&selectors.title)
        .next()
        .ok_or(ParseError::MissingField("title"))?;
    let title = element_text(title_section)
        .ok_or(ParseError::MissingField("title"))?
        .to_lowercase();
    let link = title_section
        .value()
        .attr("href")
        .and_then(canonical_job_link)
        .ok_or(ParseError::MissingField("link"))?;

    let company_section = card
        .select(&selectors.company)
        .next()
        .ok_or(ParseError::MissingField("company"))?;
    let company = Company {
        name: element_text(company_section)
            .ok_or(ParseError::MissingField("company name"))?
            .to_lowercase(),
        link: company_section
            .value()
            .attr("href")
            .ok_or(ParseError::MissingField("company link"))?
            .to_string(),
    };

    let location = card
        .select(&selectors.location)
        .next()
        .map(|section| parse_location(&section.text().collect::<String>()))
        .ok_or(ParseError::MissingField("location"))?;

    Ok(Job {
        title,
        link,
        company,
        location,
        details: None,
    })
}

/// Parses one listing page in markup order.
///
/// A card missing its title, link, company or location is skipped with a
/// warning; the remaining cards still come back.
pub fn parse_listing_page(markup: &str) -> Result<Vec<Job>, ParseError> {
    let document = Html::parse_document(markup);
    let selectors = ListingSelectors::new()?;

    let mut jobs = Vec::new();
    for (index, card) in document.select(&selectors.card).enumerate() {
        match parse_card(card, &selectors) {
            Ok(job) => jobs.push(job),
            Err(err) => warn!(index, error = %err, "skipping malformed listing card"),
        }
    }
    Ok(jobs)
}

fn strip_spaces_and_hyphens(value: &str) -> String {
    value.chars().filter(|c| *c != '-' && *c != ' ').collect()
}

/// Parses a posting page. A page without its description block is reported
/// as `MissingSection`, which the fetcher retries.
pub fn parse_detail_page(markup: &str) -> Result<JobDetails, ParseError> {
    let document = Html::parse_document(markup);
    let description_sel = selector("div.show-more-less-html__markup")?;
    let criteria_sel = selector("li.description__job-criteria-item")?;
    let label_sel = selector("h3")?;
    let value_sel = selector("span")?;

    let description_section = document
        .select(&description_sel)
        .next()
        .ok_or(ParseError::MissingSection("description"))?;

    let mut details = JobDetails {
        description: element_text(description_section),
        ..JobDetails::default()
    };

    for item in document.select(&criteria_sel) {
        let Some(label) = item.select(&label_sel).next().and_then(element_text) else {
            continue;
        };
        let Some(value) = item
            .select(&value_sel)
            .next()
            .and_then(element_text)
            .map(|v| v.to_lowercase())
        else {
            continue;
        };

        match label.as_str() {
            "Seniority level" => details.seniority_level = Some(strip_spaces_and_hyphens(&value)),
            "Employment type" => {
                details.employment_type = Some(EmploymentType::from_alias(&value)?);
            }
            "Job function" => details.job_function = Some(value),
            "Industries" => details.industries = Some(value),
            _ => {}
        }
    }

    Ok(details)
}
