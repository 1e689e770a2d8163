//! Browser-like header profiles.
//!
//! A profile is a coherent desktop fingerprint (user agent plus the client
//! hints a real browser of that family would send). Profiles are shared
//! between requests and rotated periodically, not per request.
use rand::{rng, seq::IndexedRandom, Rng};
use std::sync::{Arc, Mutex};

const DEFAULT_USER_AGENTS: [&str; 6] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:132.0) Gecko/20100101 Firefox/132.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_6) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
];

const ACCEPT_LANGUAGES: [&str; 3] = [
    "en-US,en;q=0.9",
    "en-US,en;q=0.8",
    "en-US,en;q=0.9,es;q=0.7",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderProfile {
    pub user_agent: String,
    pub accept_language: String,
    /// `(name, value)` pairs sent in addition to the user agent.
    pub headers: Vec<(String, String)>,
}

impl HeaderProfile {
    /// Build a profile for `user_agent`, deriving client hints from it.
    pub fn for_user_agent(user_agent: &str, accept_language: &str) -> Self {
        let mut headers = vec![
            ("accept".to_string(), "*/*".to_string()),
            ("accept-language".to_string(), accept_language.to_string()),
            ("sec-fetch-dest".to_string(), "empty".to_string()),
            ("sec-fetch-mode".to_string(), "cors".to_string()),
            ("sec-fetch-site".to_string(), "same-origin".to_string()),
        ];

        if let Some(major) = chrome_major(user_agent) {
            headers.push((
                "sec-ch-ua".to_string(),
                format!(
                    "\"Chromium\";v=\"{major}\", \"Google Chrome\";v=\"{major}\", \"Not?A_Brand\";v=\"99\""
                ),
            ));
            headers.push(("sec-ch-ua-mobile".to_string(), "?0".to_string()));
            headers.push((
                "sec-ch-ua-platform".to_string(),
                format!("\"{}\"", platform(user_agent)),
            ));
        }

        Self {
            user_agent: user_agent.to_string(),
            accept_language: accept_language.to_string(),
            headers,
        }
    }

    /// Random desktop profile drawn from `user_agents` (or the built-in list
    /// when empty).
    pub fn randomized(user_agents: &[String]) -> Self {
        let mut rng = rng();
        let user_agent = if user_agents.is_empty() {
            DEFAULT_USER_AGENTS[rng.random_range(0..DEFAULT_USER_AGENTS.len())].to_string()
        } else {
            user_agents
                .choose(&mut rng)
                .cloned()
                .unwrap_or_else(|| DEFAULT_USER_AGENTS[0].to_string())
        };
        let accept_language = ACCEPT_LANGUAGES
            .choose(&mut rng)
            .copied()
            .unwrap_or(ACCEPT_LANGUAGES[0]);

        Self::for_user_agent(&user_agent, accept_language)
    }
}

fn chrome_major(user_agent: &str) -> Option<&str> {
    let rest = user_agent.split("Chrome/").nth(1)?;
    rest.split('.').next().filter(|v| !v.is_empty())
}

fn platform(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows") {
        "Windows"
    } else if user_agent.contains("Macintosh") {
        "macOS"
    } else {
        "Linux"
    }
}

pub trait HeaderProvider: Send + Sync + std::fmt::Debug {
    fn profile(&self) -> Arc<HeaderProfile>;
}

#[derive(Debug)]
struct RotationState {
    current: Arc<HeaderProfile>,
    served: u64,
}

/// Serves the same profile for `refresh_every` requests, then regenerates.
#[derive(Debug)]
pub struct RotatingHeaderProvider {
    user_agents: Vec<String>,
    refresh_every: u64,
    state: Mutex<RotationState>,
}

impl RotatingHeaderProvider {
    pub fn new(user_agents: Vec<String>, refresh_every: u64) -> Self {
        let current = Arc::new(HeaderProfile::randomized(&user_agents));
        Self {
            user_agents,
            refresh_every: refresh_every.max(1),
            state: Mutex::new(RotationState { current, served: 0 }),
        }
    }
}

impl HeaderProvider for RotatingHeaderProvider {
    fn profile(&self) -> Arc<HeaderProfile> {
        let Ok(mut state) = self.state.lock() else {
            return Arc::new(HeaderProfile::randomized(&self.user_agents));
        };

        if state.served >= self.refresh_every {
            state.current = Arc::new(HeaderProfile::randomized(&self.user_agents));
            state.served = 0;
            tracing::debug!("Header profile rotated: {}", state.current.user_agent);
        }
        state.served += 1;
        state.current.clone()
    }
}

/// Always serves the same profile.
#[derive(Debug)]
pub struct FixedHeaderProvider(pub Arc<HeaderProfile>);

impl HeaderProvider for FixedHeaderProvider {
    fn profile(&self) -> Arc<HeaderProfile> {
        self.0.clone()
    }
}
