//! Job catalog: zip codes × plans × specialties.
use crate::job::{Job, Plan, ServiceType};
use carecrawl_config::config::{load_json_file, load_text_file_lines, PathSettings};
use carecrawl_config::ConfigError;
use serde::Deserialize;
use std::{collections::HashSet, path::Path};

#[derive(Debug, Deserialize)]
struct PlanRecord {
    #[serde(rename = "LobMctrType")]
    lob_mctr_type: serde_json::Value,
    #[serde(rename = "NetworkCode")]
    network_code: String,
    #[serde(rename = "CoverageType")]
    coverage_type: String,
}

impl From<PlanRecord> for Plan {
    fn from(record: PlanRecord) -> Self {
        let lob = match &record.lob_mctr_type {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        Plan {
            plan_type: if lob == Some(1003) { "GHI" } else { "HIP" }.to_string(),
            network_code: record.network_code,
            coverage_type: record.coverage_type,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpecialtyRecord {
    code: String,
}

#[derive(Debug, Clone, Default)]
pub struct JobCatalog {
    pub zip_codes: Vec<String>,
    pub plans: Vec<Plan>,
    pub doctor: Vec<String>,
    pub pcp: Vec<String>,
    pub dental: Vec<String>,
}

impl JobCatalog {
    pub fn load(paths: &PathSettings) -> Result<Self, ConfigError> {
        let zip_codes = load_zip_codes(&paths.zips_file)?;
        let plans = load_json_file::<Vec<PlanRecord>>(&paths.plans_file)?
            .into_iter()
            .map(Plan::from)
            .collect();

        let specialties = |kind: &str| -> Result<Vec<String>, ConfigError> {
            let path = paths
                .specialities_dir
                .join(format!("specialities-{kind}-types.json"));
            Ok(load_json_file::<Vec<SpecialtyRecord>>(path)?
                .into_iter()
                .map(|r| r.code)
                .collect())
        };

        let catalog = Self {
            zip_codes,
            plans,
            doctor: specialties("doctor")?,
            pcp: specialties("pcp")?,
            dental: specialties("dental")?,
        };
        tracing::info!(
            "Catalog loaded: {} zips, {} plans, {}/{}/{} doctor/pcp/dental specialties",
            catalog.zip_codes.len(),
            catalog.plans.len(),
            catalog.doctor.len(),
            catalog.pcp.len(),
            catalog.dental.len()
        );
        Ok(catalog)
    }

    /// Expand zip → plan → specialty. Dental plans get dental specialties,
    /// all other plans doctor then PCP specialties.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for zip in &self.zip_codes {
            for plan in &self.plans {
                let specialties: Vec<(&String, ServiceType)> = if plan.is_dental() {
                    self.dental.iter().map(|s| (s, ServiceType::Dental)).collect()
                } else {
                    self.doctor
                        .iter()
                        .map(|s| (s, ServiceType::Doctor))
                        .chain(self.pcp.iter().map(|s| (s, ServiceType::Pcp)))
                        .collect()
                };
                for (specialty, service_type) in specialties {
                    jobs.push(Job::new(
                        zip.clone(),
                        plan.clone(),
                        specialty.clone(),
                        service_type,
                    ));
                }
            }
        }
        jobs
    }
}

/// Load zip codes from a CSV (a `zip` column, or the first column) or a
/// plain one-per-line file.
pub fn load_zip_codes(path: impl AsRef<Path>) -> Result<Vec<String>, ConfigError> {
    let lines = load_text_file_lines(path)?;
    Ok(parse_zip_codes(&lines))
}

fn parse_zip_codes(lines: &[String]) -> Vec<String> {
    let mut rows = lines.iter().filter(|l| !l.trim().is_empty()).peekable();

    let mut column = 0;
    if let Some(first) = rows.peek() {
        let cells = split_row(first);
        if cells.first().is_some_and(|c| normalize_zip(c).is_none()) {
            column = cells
                .iter()
                .position(|c| c.eq_ignore_ascii_case("zip") || c.eq_ignore_ascii_case("zip_code"))
                .unwrap_or(0);
            rows.next();
        }
    }

    let mut seen = HashSet::new();
    let mut zips = Vec::new();
    for row in rows {
        let cells = split_row(row);
        match cells.get(column).and_then(|c| normalize_zip(c)) {
            Some(zip) => {
                if seen.insert(zip.clone()) {
                    zips.push(zip);
                }
            }
            None => tracing::warn!("Skipping malformed zip row: {row}"),
        }
    }
    zips
}

fn split_row(row: &str) -> Vec<String> {
    row.split(',')
        .map(|c| c.trim().trim_matches('"').trim().to_string())
        .collect()
}

fn normalize_zip(cell: &str) -> Option<String> {
    // Spreadsheet exports sometimes store zips as floats: "501.0".
    let digits = cell.strip_suffix(".0").unwrap_or(cell);
    if digits.is_empty() || digits.len() > 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("{digits:0>5}"))
}
