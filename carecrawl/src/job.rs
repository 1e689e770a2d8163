use carecrawl_cache::CacheKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Directory section a specialty code belongs to, as the API spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    Doctor,
    #[serde(rename = "PCP")]
    Pcp,
    Dental,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Doctor => "Doctor",
            Self::Pcp => "PCP",
            Self::Dental => "Dental",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Plan {
    /// `HIP` or `GHI`.
    pub plan_type: String,
    pub network_code: String,
    /// `M` medical, `D` dental, ...
    pub coverage_type: String,
}

impl Plan {
    pub fn is_dental(&self) -> bool {
        self.coverage_type.eq_ignore_ascii_case("D")
    }
}

/// One (zip, plan, specialty, service type) listing query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    pub zip_code: String,
    pub plan: Plan,
    pub specialty: String,
    pub service_type: ServiceType,
}

impl Job {
    pub fn new(
        zip_code: impl Into<String>,
        plan: Plan,
        specialty: impl Into<String>,
        service_type: ServiceType,
    ) -> Self {
        Self {
            zip_code: zip_code.into(),
            plan,
            specialty: specialty.into(),
            service_type,
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::namespaced(
            "job",
            [
                self.zip_code.as_str(),
                self.plan.plan_type.as_str(),
                self.plan.network_code.as_str(),
                self.service_type.as_str(),
                self.specialty.as_str(),
            ],
        )
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.zip_code,
            self.plan.plan_type,
            self.plan.network_code,
            self.service_type,
            self.specialty
        )
    }
}

pub fn provider_cache_key(provider_id: &str) -> CacheKey {
    CacheKey::namespaced("provider", [provider_id])
}
