//! Core domain model for job listing searches.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobscout-core";

/// Free-text search against a job board, plus optional board filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchQuery {
    pub keywords: String,
    pub location: String,
    pub limit: usize,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub geo_id: Option<String>,
    #[serde(default)]
    pub workplace: Option<String>,
    #[serde(default)]
    pub experience: Option<String>,
    #[serde(default)]
    pub job_type: Option<String>,
}

impl SearchQuery {
    pub fn new(keywords: impl Into<String>, location: impl Into<String>, limit: usize) -> Self {
        Self {
            keywords: keywords.into(),
            location: location.into(),
            limit,
            locale: None,
            geo_id: None,
            workplace: None,
            experience: None,
            job_type: None,
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_geo_id(mut self, geo_id: impl Into<String>) -> Self {
        self.geo_id = Some(geo_id.into());
        self
    }

    pub fn with_workplace(mut self, workplace: impl Into<String>) -> Self {
        self.workplace = Some(workplace.into());
        self
    }

    pub fn with_experience(mut self, experience: impl Into<String>) -> Self {
        self.experience = Some(experience.into());
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} alias {alias:?} not found")]
pub struct AliasNotFound {
    pub kind: &'static str,
    pub alias: String,
}

/// Failure to turn one page of markup into typed records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("required section `{0}` not found")]
    MissingSection(&'static str),
    #[error("required field `{0}` not found")]
    MissingField(&'static str),
    #[error("invalid selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error(transparent)]
    Alias(#[from] AliasNotFound),
}

impl ParseError {
    /// A page that loaded without its required sections. Boards serve these
    /// while throttling, so callers retry them like a 429.
    pub fn is_malformed_page(&self) -> bool {
        matches!(self, ParseError::MissingSection(_))
    }
}

/// Lowercase and drop whitespace and hyphens, the form alias tables are keyed by.
pub fn normalize_alias(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}

fn build_alias_index<T: Copy>(entries: &[(T, &[&str])]) -> HashMap<String, T> {
    let mut index = HashMap::new();
    for (value, aliases) in entries {
        for alias in aliases.iter() {
            index.insert(normalize_alias(alias), *value);
        }
    }
    index
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmploymentType {
    FullTime,
    PartTime,
    Internship,
    PerDiem,
    Nights,
    Other,
    Summer,
    Volunteer,
    SelfEmployed,
}

const EMPLOYMENT_TYPE_ALIASES: &[(EmploymentType, &[&str])] = &[
    (
        EmploymentType::FullTime,
        &[
            "fulltime",
            "períodointegral",
            "estágio/trainee",
            "cunormăîntreagă",
            "tiempocompleto",
            "vollzeit",
            "voltijds",
            "tempointegral",
            "全职",
            "plnýúvazek",
            "fuldtid",
            "دوامكامل",
            "kokopäivätyö",
            "tempsplein",
            "πλήρηςαπασχόληση",
            "teljesmunkaidő",
            "tempopieno",
            "heltid",
            "jornadacompleta",
            "pełnyetat",
            "정규직",
            "100%",
            "全職",
            "งานประจำ",
            "tamzamanli",
            "повназайнятість",
            "toànthờigian",
        ],
    ),
    (
        EmploymentType::PartTime,
        &["parttime", "teilzeit", "částečnýúvazek", "deltid"],
    ),
    (
        EmploymentType::Internship,
        &[
            "internship",
            "prácticas",
            "ojt(onthejobtraining)",
            "praktikum",
            "praktik",
        ],
    ),
    (EmploymentType::PerDiem, &["perdiem"]),
    (EmploymentType::Nights, &["nights"]),
    (EmploymentType::Other, &["other"]),
    (EmploymentType::Summer, &["summer"]),
    (EmploymentType::Volunteer, &["volunteer"]),
    (EmploymentType::SelfEmployed, &["contract"]),
];

static EMPLOYMENT_TYPE_INDEX: LazyLock<HashMap<String, EmploymentType>> =
    LazyLock::new(|| build_alias_index(EMPLOYMENT_TYPE_ALIASES));

impl EmploymentType {
    pub fn from_alias(alias: &str) -> Result<Self, AliasNotFound> {
        EMPLOYMENT_TYPE_INDEX
            .get(&normalize_alias(alias))
            .copied()
            .ok_or_else(|| AliasNotFound {
                kind: "employment type",
                alias: alias.to_string(),
            })
    }

    pub fn aliases(self) -> &'static [&'static str] {
        EMPLOYMENT_TYPE_ALIASES
            .iter()
            .find(|(value, _)| *value == self)
            .map(|(_, aliases)| *aliases)
            .unwrap_or_default()
    }
}

impl fmt::Display for EmploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.aliases().first().copied().unwrap_or("other"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Country {
    Austria,
    Bahrain,
    Belgium,
    Brazil,
    Canada,
    Chile,
    China,
    Colombia,
    CostaRica,
    CzechRepublic,
    Denmark,
    Ecuador,
    Egypt,
    Finland,
    France,
    Germany,
    Greece,
    HongKong,
    Hungary,
    India,
    Indonesia,
    Ireland,
    Israel,
    Italy,
    Japan,
    Kuwait,
    Luxembourg,
    Malaysia,
    Mexico,
    Morocco,
    Netherlands,
    NewZealand,
    Nigeria,
    Norway,
    Oman,
    Pakistan,
    Panama,
    Peru,
    Philippines,
    Poland,
    Portugal,
    Qatar,
    Romania,
    SaudiArabia,
    Singapore,
    SouthAfrica,
    SouthKorea,
    Spain,
    Sweden,
    Switzerland,
    Taiwan,
    Thailand,
    Turkey,
    Ukraine,
    UnitedArabEmirates,
    UnitedKingdom,
    UnitedStates,
    Uruguay,
    Venezuela,
    Vietnam,
    Worldwide,
}

const COUNTRY_ALIASES: &[(Country, &[&str])] = &[
    (Country::Austria, &["austria", "at"]),
    (Country::Bahrain, &["bahrain", "bh"]),
    (Country::Belgium, &["belgium", "be"]),
    (Country::Brazil, &["brazil", "br"]),
    (Country::Canada, &["canada", "ca"]),
    (Country::Chile, &["chile", "cl"]),
    (Country::China, &["china", "cn"]),
    (Country::Colombia, &["colombia", "col"]),
    (Country::CostaRica, &["costa rica", "cr"]),
    (Country::CzechRepublic, &["czech republic", "cz"]),
    (Country::Denmark, &["denmark", "dk"]),
    (Country::Ecuador, &["ecuador", "ec"]),
    (Country::Egypt, &["egypt", "eg"]),
    (Country::Finland, &["finland", "fi"]),
    (Country::France, &["france", "fr"]),
    (Country::Germany, &["germany", "de"]),
    (Country::Greece, &["greece", "gr"]),
    (Country::HongKong, &["hong kong", "hk"]),
    (Country::Hungary, &["hungary", "hu"]),
    (Country::India, &["india", "in"]),
    (Country::Indonesia, &["indonesia", "id"]),
    (Country::Ireland, &["ireland", "ie"]),
    (Country::Israel, &["israel", "il"]),
    (Country::Italy, &["italy", "it"]),
    (Country::Japan, &["japan", "jp"]),
    (Country::Kuwait, &["kuwait", "kw"]),
    (Country::Luxembourg, &["luxembourg", "lu"]),
    (Country::Malaysia, &["malaysia", "my"]),
    (Country::Mexico, &["mexico", "mx"]),
    (Country::Morocco, &["morocco", "ma"]),
    (Country::Netherlands, &["netherlands", "nl"]),
    (Country::NewZealand, &["new zealand", "nz"]),
    (Country::Nigeria, &["nigeria", "ng"]),
    (Country::Norway, &["norway", "no"]),
    (Country::Oman, &["oman", "om"]),
    (Country::Pakistan, &["pakistan", "pk"]),
    (Country::Panama, &["panama", "pa"]),
    (Country::Peru, &["peru", "pe"]),
    (Country::Philippines, &["philippines", "ph"]),
    (Country::Poland, &["poland", "pl"]),
    (Country::Portugal, &["portugal", "pt"]),
    (Country::Qatar, &["qatar", "qa"]),
    (Country::Romania, &["romania", "ro"]),
    (Country::SaudiArabia, &["saudi arabia", "sa"]),
    (Country::Singapore, &["singapore", "sg"]),
    (Country::SouthAfrica, &["south africa", "za"]),
    (Country::SouthKorea, &["south korea", "kr"]),
    (Country::Spain, &["spain", "es"]),
    (Country::Sweden, &["sweden", "se"]),
    (Country::Switzerland, &["switzerland", "ch"]),
    (Country::Taiwan, &["taiwan", "tw"]),
    (Country::Thailand, &["thailand", "th"]),
    (Country::Turkey, &["turkey", "tr"]),
    (Country::Ukraine, &["ukraine", "ua"]),
    (Country::UnitedArabEmirates, &["united arab emirates", "ae"]),
    (Country::UnitedKingdom, &["united kingdom", "uk"]),
    (Country::UnitedStates, &["united states", "us", "usa"]),
    (Country::Uruguay, &["uruguay", "uy"]),
    (Country::Venezuela, &["venezuela", "ve"]),
    (Country::Vietnam, &["vietnam", "vn"]),
    (Country::Worldwide, &["worldwide", "ww"]),
];

static COUNTRY_INDEX: LazyLock<HashMap<String, Country>> =
    LazyLock::new(|| build_alias_index(COUNTRY_ALIASES));

impl Country {
    pub fn from_alias(alias: &str) -> Result<Self, AliasNotFound> {
        COUNTRY_INDEX
            .get(&normalize_alias(alias))
            .copied()
            .ok_or_else(|| AliasNotFound {
                kind: "country",
                alias: alias.to_string(),
            })
    }

    pub fn aliases(self) -> &'static [&'static str] {
        COUNTRY_ALIASES
            .iter()
            .find(|(value, _)| *value == self)
            .map(|(_, aliases)| *aliases)
            .unwrap_or_default()
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.aliases().first().copied().unwrap_or("worldwide"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub country: Country,
    pub city: Option<String>,
    pub region: Option<String>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(city) = &self.city {
            write!(f, "{city}, ")?;
        }
        if let Some(region) = &self.region {
            write!(f, "{region}, ")?;
        }
        write!(f, "{}", self.country)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub name: String,
    pub link: String,
}

impl PartialEq for Company {
    fn eq(&self, other: &Self) -> bool {
        self.link == other.link
    }
}

impl Eq for Company {}

impl Hash for Company {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.link.hash(state);
    }
}

/// Detail-page enrichment. Every field may legitimately be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetails {
    pub description: Option<String>,
    pub employment_type: Option<EmploymentType>,
    pub seniority_level: Option<String>,
    pub job_function: Option<String>,
    pub industries: Option<String>,
}

/// A single listing. Identity is the canonical link alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub title: String,
    pub link: String,
    pub company: Company,
    pub location: Location,
    #[serde(default)]
    pub details: Option<JobDetails>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.link == other.link
    }
}

impl Eq for Job {}

impl Hash for Job {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.link.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn job(title: &str, link: &str) -> Job {
        Job {
            title: title.to_string(),
            link: link.to_string(),
            company: Company {
                name: "acme".to_string(),
                link: "https://www.linkedin.com/company/acme".to_string(),
            },
            location: Location {
                country: Country::Italy,
                city: Some("milan".to_string()),
                region: None,
            },
            details: None,
        }
    }

    #[test]
    fn every_employment_type_alias_resolves_to_its_owner() {
        for (value, aliases) in EMPLOYMENT_TYPE_ALIASES {
            for alias in aliases.iter() {
                assert_eq!(EmploymentType::from_alias(alias), Ok(*value), "alias {alias}");
            }
        }
    }

    #[test]
    fn every_country_alias_resolves_to_its_owner() {
        for (value, aliases) in COUNTRY_ALIASES {
            for alias in aliases.iter() {
                assert_eq!(Country::from_alias(alias), Ok(*value), "alias {alias}");
            }
        }
    }

    #[test]
    fn alias_lookup_ignores_case_spaces_and_hyphens() {
        assert_eq!(EmploymentType::from_alias("Full-time"), Ok(EmploymentType::FullTime));
        assert_eq!(EmploymentType::from_alias(" Part Time "), Ok(EmploymentType::PartTime));
        assert_eq!(EmploymentType::from_alias("Vollzeit"), Ok(EmploymentType::FullTime));
        assert_eq!(EmploymentType::from_alias("全职"), Ok(EmploymentType::FullTime));
        assert_eq!(Country::from_alias("Costa Rica"), Ok(Country::CostaRica));
        assert_eq!(Country::from_alias("USA"), Ok(Country::UnitedStates));
    }

    #[test]
    fn unknown_aliases_are_errors_not_defaults() {
        let err = EmploymentType::from_alias("gig").unwrap_err();
        assert_eq!(err.kind, "employment type");
        assert_eq!(err.alias, "gig");

        let err = Country::from_alias("greater milan metropolitan area").unwrap_err();
        assert_eq!(err.kind, "country");
        assert!(Country::from_alias("").is_err());
    }

    #[test]
    fn display_uses_the_first_alias() {
        assert_eq!(EmploymentType::FullTime.to_string(), "fulltime");
        assert_eq!(EmploymentType::SelfEmployed.to_string(), "contract");
        assert_eq!(Country::UnitedStates.to_string(), "united states");
    }

    #[test]
    fn location_display_skips_missing_parts() {
        let location = Location {
            country: Country::Italy,
            city: Some("milan".to_string()),
            region: Some("lombardy".to_string()),
        };
        assert_eq!(location.to_string(), "milan, lombardy, italy");

        let location = Location {
            country: Country::Worldwide,
            city: None,
            region: None,
        };
        assert_eq!(location.to_string(), "worldwide");
    }

    #[test]
    fn jobs_sharing_a_link_are_the_same_job() {
        let link = "https://www.linkedin.com/jobs/view/3812345678";
        let a = job("senior rust engineer", link);
        let mut b = job("Senior Rust Engineer  ", link);
        b.location.city = None;
        b.details = Some(JobDetails::default());

        assert_eq!(a, b);
        let set: HashSet<Job> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);

        assert_ne!(
            job("senior rust engineer", link),
            job("senior rust engineer", "https://www.linkedin.com/jobs/view/1")
        );
    }

    #[test]
    fn search_query_is_a_value_key() {
        let a = SearchQuery::new("rust", "italy", 50).with_locale("en_US");
        let b = SearchQuery::new("rust", "italy", 50).with_locale("en_US");
        let set: HashSet<SearchQuery> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(a, SearchQuery::new("rust", "italy", 75));
    }

    #[test]
    fn only_missing_sections_count_as_malformed_pages() {
        assert!(ParseError::MissingSection("description").is_malformed_page());
        assert!(!ParseError::MissingField("title").is_malformed_page());
        assert!(!ParseError::Alias(AliasNotFound {
            kind: "country",
            alias: "atlantis".to_string(),
        })
        .is_malformed_page());
    }

    #[test]
    fn job_round_trips_through_json_without_details() {
        let value = serde_json::json!({
            "title": "rust engineer",
            "link": "https://www.linkedin.com/jobs/view/42",
            "company": { "name": "acme", "link": "https://www.linkedin.com/company/acme" },
            "location": { "country": "Italy", "city": null, "region": null }
        });
        let job: Job = serde_json::from_value(value).expect("job json");
        assert!(job.details.is_none());
        assert_eq!(job.location.country, Country::Italy);
    }
}
