use crate::proxy::{ProxyConfig, ProxyRotation};
use serde::de::DeserializeOwned;
use std::{
    fmt, fs,
    io::{self, BufRead},
    path::{self, PathBuf},
    str::FromStr,
    time::Duration,
};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Line parsing error: {0}")]
    LineParse(String),
    #[error("Missing credential: {0}")]
    MissingCredential(String),
    #[error("Proxy configuration error: {0}")]
    ProxyConfig(String),
    #[error("Invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Load `Vec<String>` from the file at `file_path`, one entry per line.
pub fn load_text_file_lines(
    file_path: impl AsRef<path::Path>,
) -> Result<Vec<String>, ConfigError> {
    let file = fs::File::open(file_path)?;
    let lines = io::BufReader::new(file)
        .lines()
        .map(|l| l.map_err(|e| ConfigError::LineParse(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines)
}

pub fn load_json_file<T: DeserializeOwned>(
    file_path: impl AsRef<path::Path>,
) -> Result<T, ConfigError> {
    let content = fs::read_to_string(file_path)?;
    Ok(serde_json::from_str(&content)?)
}

const DEFAULT_BASE_URL: &str = "https://my.emblemhealth.com";
const DEFAULT_CAPTCHA_PAGE_URL: &str = "https://my.emblemhealth.com/member/s/find-care-search?action=findcaresearch&isPublic=true&publicPage=Plan&lobId=1012&lobMctrType=1001&grgrMctrType=NOT%20APPLICABLE&productDescription=NOT%20APPLICABLE&groupNum=NOT%20APPLICABLE&coverageType=M&networkCode=D013%2C%20D014%2C%20D004%2C%20D005%2C%20D006%2C%20D003&network=Enhanced%20Care%20Prime%20NYSOH%20Marketplace%20Network&planName=Essential%20Plan&fhn&category=Individual%20%26%20Family%20Plans&preferred=No&coe=No";
const DEFAULT_AURA_FWUID: &str = "VFJhRGxfRlFsN29ySGg2SXFsaUZsQTFLcUUxeUY3ZVB6dE9hR0VheDVpb2cxMy4zMzU1NDQzMi41MDMzMTY0OA";
const DEFAULT_AURA_APP_LOADED: &str = "1411_ppEHPnivv6tDSveOy-pRIw";

/// One entry of the CAPTCHA fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptchaStrategy {
    TwoCaptcha,
    CapSolver,
    Browser,
}

impl fmt::Display for CaptchaStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TwoCaptcha => "two_captcha",
            Self::CapSolver => "capsolver",
            Self::Browser => "browser",
        };
        f.write_str(name)
    }
}

impl FromStr for CaptchaStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "two_captcha" | "2captcha" | "twocaptcha" => Ok(Self::TwoCaptcha),
            "capsolver" => Ok(Self::CapSolver),
            "browser" | "playwright" | "fake" => Ok(Self::Browser),
            other => Err(ConfigError::InvalidValue {
                key: "CAPTCHA_STRATEGY".into(),
                value: other.into(),
                reason: "expected one of two_captcha, capsolver, browser".into(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TargetSettings {
    pub base_url: String,
    pub aura_fwuid: String,
    pub aura_app_loaded: String,
    pub page_size: u32,
    pub search_distance: String,
}

#[derive(Debug, Clone)]
pub struct CaptchaSettings {
    pub site_key: String,
    pub page_url: String,
    pub action: String,
    pub strategies: Vec<CaptchaStrategy>,
    pub two_captcha_key: Option<String>,
    pub capsolver_key: Option<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub token_validity: Duration,
    pub detail_requires_captcha: bool,
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub headless: bool,
    pub session_path: PathBuf,
    pub executable: Option<PathBuf>,
    pub max_sessions: usize,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max_interval: Duration,
    pub backoff_jitter: f64,
    pub header_refresh_requests: u64,
    pub user_agents_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub sequential: bool,
    pub concurrency: usize,
    pub batch_size: usize,
    pub max_pages: u32,
    pub detail_concurrency: usize,
    pub reprocess_failed: bool,
}

#[derive(Debug, Clone)]
pub struct PathSettings {
    pub output: PathBuf,
    pub cache: PathBuf,
    pub failed_jobs: PathBuf,
    pub critical_log: PathBuf,
    pub zips_file: PathBuf,
    pub plans_file: PathBuf,
    pub specialities_dir: PathBuf,
}

/// Immutable settings read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub target: TargetSettings,
    pub captcha: CaptchaSettings,
    pub browser: BrowserSettings,
    pub proxy: ProxyConfig,
    pub http: HttpSettings,
    pub flow: FlowSettings,
    pub paths: PathSettings,
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.raw(key))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.raw(key) {
            Some(value) => value.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.into(),
                value: value.clone(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.into(),
                    value,
                    reason: "expected a boolean".into(),
                }),
            },
            None => Ok(default),
        }
    }

    fn secs_or(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(self.parse_or(key, default)?))
    }
}

impl Settings {
    /// Load `.env` (if present) and read settings from the process
    /// environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let target = TargetSettings {
            base_url: env
                .string_or("BASE_URL", DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            aura_fwuid: env.string_or("AURA_FWUID", DEFAULT_AURA_FWUID),
            aura_app_loaded: env.string_or("AURA_APP_LOADED", DEFAULT_AURA_APP_LOADED),
            page_size: env.parse_or("PAGE_SIZE", 50)?,
            search_distance: env.string_or("SEARCH_DISTANCE", "50mi"),
        };

        let strategies = env
            .string_or("CAPTCHA_STRATEGY", "browser")
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(CaptchaStrategy::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        let captcha = CaptchaSettings {
            site_key: env.raw("CAPTCHA_SITE_KEY").unwrap_or_default(),
            page_url: env.string_or("CAPTCHA_PAGE_URL", DEFAULT_CAPTCHA_PAGE_URL),
            action: env.string_or("CAPTCHA_ACTION", "captchaValidation"),
            strategies,
            two_captcha_key: env.raw("APIKEY_2CAPTCHA"),
            capsolver_key: env.raw("CAPSOLVER_API_KEY"),
            timeout: env.secs_or("CAPTCHA_TIMEOUT_SECS", 120)?,
            poll_interval: env.secs_or("CAPTCHA_POLL_INTERVAL_SECS", 5)?,
            token_validity: env.secs_or("CAPTCHA_TOKEN_VALIDITY_SECS", 110)?,
            detail_requires_captcha: env.bool_or("DETAIL_REQUIRES_CAPTCHA", false)?,
        };

        let browser = BrowserSettings {
            headless: env.bool_or("HEADLESS", false)?,
            session_path: env
                .first(&["BROWSER_SESSION_PATH", "PLAYWRIGHT_SESSION_PATH"])
                .unwrap_or_else(|| "sessions/recaptcha_profile".into())
                .into(),
            executable: env.raw("BROWSER_EXECUTABLE").map(PathBuf::from),
            max_sessions: env.parse_or("BROWSER_MAX_SESSIONS", 1)?,
            attempts: env.parse_or("BROWSER_ATTEMPTS", 5)?,
        };

        let rotation: ProxyRotation = env.parse_or("PROXY_ROTATION", ProxyRotation::Random)?;
        let proxy = if let Some(uri) = env.raw("HTTP_PROXY") {
            ProxyConfig::from_uri(&uri, rotation)
        } else if let Some(host) = env.raw("PROXY_HOST") {
            ProxyConfig::from_parts(
                &host,
                env.raw("PROXY_PORT").as_deref(),
                env.raw("PROXY_USERNAME").as_deref(),
                env.raw("PROXY_PASSWORD").as_deref(),
                rotation,
            )?
        } else {
            if env.raw("PROXY_PORT").is_some() {
                return Err(ConfigError::ProxyConfig(
                    "PROXY_PORT set without PROXY_HOST".into(),
                ));
            }
            ProxyConfig::disabled()
        };

        let http = HttpSettings {
            max_attempts: env.parse_or("HTTP_MAX_ATTEMPTS", 5)?,
            timeout: env.secs_or("HTTP_TIMEOUT_SECS", 60)?,
            connect_timeout: env.secs_or("HTTP_CONNECT_TIMEOUT_SECS", 10)?,
            backoff_initial: Duration::from_millis(env.parse_or("BACKOFF_INITIAL_MS", 1000)?),
            backoff_multiplier: env.parse_or("BACKOFF_MULTIPLIER", 2.5)?,
            backoff_max_interval: env.secs_or("BACKOFF_MAX_INTERVAL_SECS", 60)?,
            backoff_jitter: env.parse_or("BACKOFF_JITTER", 0.3)?,
            header_refresh_requests: env.parse_or("HEADER_REFRESH_REQUESTS", 25)?,
            user_agents_file: env.raw("USER_AGENTS_FILE").map(PathBuf::from),
        };

        let flow = FlowSettings {
            sequential: env.bool_or("SEQUENTIAL_FLOW", true)?,
            concurrency: match env.raw("CONCURRENCY") {
                Some(_) => env.parse_or("CONCURRENCY", 5)?,
                None => env.parse_or("SEMAPHORE", 5)?,
            },
            batch_size: env.parse_or("BATCH_SIZE", 50)?,
            max_pages: env.parse_or("MAX_PAGES", 200)?,
            detail_concurrency: env.parse_or("DETAIL_CONCURRENCY", 1)?,
            reprocess_failed: env.bool_or("REPROCESS_FAILED", false)?,
        };

        let paths = PathSettings {
            output: env.string_or("OUTPUT_PATH", "outputs/raw").into(),
            cache: env.string_or("CACHE_PATH", "outputs/static/cache").into(),
            failed_jobs: env
                .string_or("FAILED_JOBS_PATH", "outputs/failed_jobs.jsonl")
                .into(),
            critical_log: env.string_or("CRITICAL_LOG_PATH", "outputs/critical.log").into(),
            zips_file: env.string_or("ZIPS_FILE", "inputs/uszips.csv").into(),
            plans_file: env
                .string_or("PLANS_FILE", "inputs/raw_files/plans.json")
                .into(),
            specialities_dir: env.string_or("SPECIALITIES_DIR", "inputs/raw_files").into(),
        };

        let settings = Self {
            target,
            captcha,
            browser,
            proxy,
            http,
            flow,
            paths,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Fail fast on anything that would only surface once jobs are running.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.captcha.strategies.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "CAPTCHA_STRATEGY".into(),
                value: String::new(),
                reason: "at least one strategy is required".into(),
            });
        }
        if self.captcha.site_key.is_empty() {
            return Err(ConfigError::MissingCredential("CAPTCHA_SITE_KEY".into()));
        }
        for strategy in &self.captcha.strategies {
            match strategy {
                CaptchaStrategy::TwoCaptcha if self.captcha.two_captcha_key.is_none() => {
                    return Err(ConfigError::MissingCredential("APIKEY_2CAPTCHA".into()));
                }
                CaptchaStrategy::CapSolver if self.captcha.capsolver_key.is_none() => {
                    return Err(ConfigError::MissingCredential("CAPSOLVER_API_KEY".into()));
                }
                _ => {}
            }
        }
        for (key, value) in [
            ("CONCURRENCY", self.flow.concurrency),
            ("BATCH_SIZE", self.flow.batch_size),
            ("DETAIL_CONCURRENCY", self.flow.detail_concurrency),
            ("BROWSER_MAX_SESSIONS", self.browser.max_sessions),
            ("PAGE_SIZE", self.target.page_size as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    value: "0".into(),
                    reason: "must be at least 1".into(),
                });
            }
        }
        if self.http.max_attempts == 0 || self.flow.max_pages == 0 {
            return Err(ConfigError::InvalidValue {
                key: "HTTP_MAX_ATTEMPTS/MAX_PAGES".into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
