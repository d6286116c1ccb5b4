//! Request builders for the provider endpoints in regular use.
//!
//! Each builder only assembles a [`FetchRequest`]; nothing here touches the
//! network. Pass the result to [`Dispatcher::fetch_request`] or collect
//! several for [`Dispatcher::fetch_all`].
//!
//! [`Dispatcher::fetch_request`]: crate::Dispatcher::fetch_request
//! [`Dispatcher::fetch_all`]: crate::Dispatcher::fetch_all

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, TimeDelta, Utc};

use crate::fingerprint::Params;
use crate::request::FetchRequest;
use crate::{HeimdallError, Result};

/// Default look-back window for sales estimates.
const DEFAULT_SALES_WINDOW_DAYS: i64 = 30;

/// App store platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = HeimdallError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            other => Err(HeimdallError::InvalidInput(format!(
                "unknown platform '{other}', expected 'ios' or 'android'"
            ))),
        }
    }
}

/// Top chart kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChartType {
    TopFree,
    TopPaid,
    TopGrossing,
}

impl ChartType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TopFree => "topfreeapplications",
            Self::TopPaid => "toppaidapplications",
            Self::TopGrossing => "topgrossingapplications",
        }
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket size for time-series estimates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DateGranularity {
    Daily,
    Weekly,
    #[default]
    Monthly,
}

impl DateGranularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for DateGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which id space the ids passed to [`unified_apps`] belong to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AppIdType {
    #[default]
    Itunes,
    Android,
    Unified,
    Cohorts,
}

impl AppIdType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Itunes => "itunes",
            Self::Android => "android",
            Self::Unified => "unified",
            Self::Cohorts => "cohorts",
        }
    }
}

impl fmt::Display for AppIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

fn collect_ids<I, V>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = V>,
    V: fmt::Display,
{
    ids.into_iter()
        .map(|id| id.to_string().trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

/// Ranked app ids for one chart on one day (default: today, UTC).
///
/// `category` is the store's own id, e.g. `"6014"` for iOS games or
/// `"GAME"` on Android.
pub fn top_apps(
    platform: Platform,
    category: &str,
    chart_type: ChartType,
    date: Option<NaiveDate>,
    country: &str,
) -> FetchRequest {
    let params = Params::new()
        .with("category", category)
        .with("chart_type", chart_type)
        .with("date", format_date(date.unwrap_or_else(today_utc)))
        .with("country", country);
    FetchRequest::new(format!("{platform}/ranking"), params)
}

/// Metadata for a batch of apps: iTunes ids on iOS, package names on Android.
pub fn app_details<I, V>(platform: Platform, app_ids: I) -> Result<FetchRequest>
where
    I: IntoIterator<Item = V>,
    V: fmt::Display,
{
    let ids = collect_ids(app_ids);
    if ids.is_empty() {
        return Err(HeimdallError::InvalidInput(
            "app_details needs at least one app id".to_string(),
        ));
    }
    Ok(FetchRequest::new(
        format!("{platform}/apps"),
        Params::new().with_list("app_ids", ids),
    ))
}

/// Filter for [`sales_estimates`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SalesQuery {
    pub app_ids: Vec<String>,
    pub publisher_ids: Vec<String>,
    pub granularity: DateGranularity,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Omit for all countries.
    pub country: Option<String>,
}

impl SalesQuery {
    pub fn for_apps<I, V>(app_ids: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: fmt::Display,
    {
        Self {
            app_ids: collect_ids(app_ids),
            ..Self::default()
        }
    }

    pub fn for_publishers<I, V>(publisher_ids: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: fmt::Display,
    {
        Self {
            publisher_ids: collect_ids(publisher_ids),
            ..Self::default()
        }
    }

    pub fn granularity(mut self, granularity: DateGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn range(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }
}

/// Download and revenue estimates.
///
/// The window ends today (UTC) unless `end_date` is set and starts 30
/// days before its end unless `start_date` is set.
pub fn sales_estimates(platform: Platform, query: &SalesQuery) -> Result<FetchRequest> {
    if query.app_ids.is_empty() && query.publisher_ids.is_empty() {
        return Err(HeimdallError::InvalidInput(
            "sales_estimates needs app ids or publisher ids".to_string(),
        ));
    }

    let end = query.end_date.unwrap_or_else(today_utc);
    let start = query.start_date.unwrap_or_else(|| {
        end.checked_sub_signed(TimeDelta::days(DEFAULT_SALES_WINDOW_DAYS))
            .unwrap_or(NaiveDate::MIN)
    });
    if start > end {
        return Err(HeimdallError::InvalidInput(format!(
            "start_date {start} is after end_date {end}"
        )));
    }

    let mut params = Params::new()
        .with("date_granularity", query.granularity)
        .with("start_date", format_date(start))
        .with("end_date", format_date(end))
        .with_opt("country", query.country.as_deref());
    if !query.app_ids.is_empty() {
        params = params.with_list("app_ids", &query.app_ids);
    }
    if !query.publisher_ids.is_empty() {
        params = params.with_list("publisher_ids", &query.publisher_ids);
    }
    Ok(FetchRequest::new(
        format!("{platform}/sales_report_estimates"),
        params,
    ))
}

/// Cross-platform app records for ids in the given id space.
pub fn unified_apps<I, V>(app_ids: I, id_type: AppIdType) -> Result<FetchRequest>
where
    I: IntoIterator<Item = V>,
    V: fmt::Display,
{
    let ids = collect_ids(app_ids);
    if ids.is_empty() {
        return Err(HeimdallError::InvalidInput(
            "unified_apps needs at least one app id".to_string(),
        ));
    }
    Ok(FetchRequest::new(
        "unified/apps",
        Params::new()
            .with_list("app_ids", ids)
            .with("app_id_type", id_type),
    ))
}
