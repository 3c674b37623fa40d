use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no view is served at '{0}'")]
    UnknownPath(String),
    #[error("invalid run number '{0}'")]
    InvalidRunNumber(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Dashboard,
    Collection,
    JobDetail,
    RunDetail,
}

impl ViewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewKind::Dashboard => "dashboard",
            ViewKind::Collection => "collection",
            ViewKind::JobDetail => "job",
            ViewKind::RunDetail => "run",
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run selector in a run page path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunNumber {
    Latest,
    Number(u64),
}

impl fmt::Display for RunNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunNumber::Latest => f.write_str("latest"),
            RunNumber::Number(number) => write!(f, "{number}"),
        }
    }
}

impl FromStr for RunNumber {
    type Err = RouteError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input == "latest" {
            return Ok(RunNumber::Latest);
        }
        input
            .parse::<u64>()
            .map(RunNumber::Number)
            .map_err(|_| RouteError::InvalidRunNumber(input.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Dashboard,
    Jobs,
    Wallboard,
    Job { name: String },
    Run { name: String, number: RunNumber },
}

impl Route {
    pub fn parse(path: &str) -> Result<Self, RouteError> {
        let segments: Vec<&str> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        match segments.as_slice() {
            [] => Ok(Route::Dashboard),
            ["jobs"] => Ok(Route::Jobs),
            ["wallboard"] => Ok(Route::Wallboard),
            ["jobs", name] => Ok(Route::Job {
                name: (*name).to_string(),
            }),
            ["jobs", name, number] => Ok(Route::Run {
                name: (*name).to_string(),
                number: number.parse()?,
            }),
            _ => Err(RouteError::UnknownPath(path.to_string())),
        }
    }

    pub fn kind(&self) -> ViewKind {
        match self {
            Route::Dashboard => ViewKind::Dashboard,
            Route::Jobs | Route::Wallboard => ViewKind::Collection,
            Route::Job { .. } => ViewKind::JobDetail,
            Route::Run { .. } => ViewKind::RunDetail,
        }
    }

    /// Resource path relative to the server root, without a leading slash.
    pub fn path(&self) -> String {
        match self {
            Route::Dashboard => String::new(),
            Route::Jobs => "jobs".to_string(),
            Route::Wallboard => "wallboard".to_string(),
            Route::Job { name } => format!("jobs/{name}"),
            Route::Run { name, number } => format!("jobs/{name}/{number}"),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.path())
    }
}

/// Ordered query parameters appended to a subscription's resource path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Query(Vec<(String, String)>);

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.0.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `?k=v&k=v`, or an empty string when there are no parameters.
    pub fn to_query_string(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.0.iter())
            .finish();
        format!("?{encoded}")
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Query {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut query = Query::new();
        for (key, value) in iter {
            query.set(key, value);
        }
        query
    }
}
