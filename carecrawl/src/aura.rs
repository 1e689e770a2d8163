//! Salesforce Aura Apex-action protocol used by the provider directory.
//!
//! Requests are form-encoded POSTs of `message`, `aura.context`,
//! `aura.pageURI` and `aura.token`. The interesting result sits in
//! `actions[].returnValue.returnValue`, usually as a JSON string wrapping
//! an `IPResult` object.
use crate::captcha::CaptchaToken;
use crate::directory::{DirectoryApi, ListingCursor, ListingPage, ProviderRef};
use crate::executor::Rejection;
use crate::job::Job;
use carecrawl_config::config::TargetSettings;
use carecrawl_config::{HttpRequest, HttpResponse};
use rand::Rng;
use serde_json::{json, Value};
use url::form_urlencoded;

const LISTING_METHOD: &str = "Member_findDoctor";
const DETAIL_METHOD: &str = "Member_providerDetails";
const DETAIL_ACTION_ID: u32 = 198;
const TENANT_ID: &str = "EH";

#[derive(Debug, Clone)]
pub struct AuraDirectoryApi {
    base_url: String,
    fwuid: String,
    app_loaded: String,
    page_size: u32,
    distance: String,
}

impl AuraDirectoryApi {
    pub fn new(target: &TargetSettings) -> Self {
        Self {
            base_url: target.base_url.trim_end_matches('/').to_string(),
            fwuid: target.aura_fwuid.clone(),
            app_loaded: target.aura_app_loaded.clone(),
            page_size: target.page_size,
            distance: target.search_distance.clone(),
        }
    }

    fn aura_context(&self) -> String {
        json!({
            "mode": "PROD",
            "fwuid": self.fwuid,
            "app": "siteforce:communityApp",
            "loaded": {
                "APPLICATION@markup://siteforce:communityApp": self.app_loaded,
            },
            "dn": [],
            "globals": {},
            "uad": true,
        })
        .to_string()
    }

    fn form_body(&self, action_id: u32, method: &str, input: &Value) -> String {
        let message = json!({
            "actions": [{
                "id": format!("{action_id};a"),
                "descriptor": "aura://ApexActionController/ACTION$execute",
                "callingDescriptor": "UNKNOWN",
                "params": {
                    "namespace": "vlocity_ins",
                    "classname": "BusinessProcessDisplayController",
                    "method": "GenericInvoke2NoCont",
                    "params": {
                        "input": input.to_string(),
                        "options": "{}",
                        "sClassName": "vlocity_ins.IntegrationProcedureService",
                        "sMethodName": method,
                    },
                    "cacheable": false,
                    "isContinuation": false,
                },
            }]
        });

        form_urlencoded::Serializer::new(String::new())
            .append_pair("message", &message.to_string())
            .append_pair("aura.context", &self.aura_context())
            .append_pair("aura.pageURI", "")
            .append_pair("aura.token", "null")
            .finish()
    }

    fn post(&self, rid: u32, body: String) -> HttpRequest {
        HttpRequest::post(format!(
            "{}/member/s/sfsites/aura?r={rid}&aura.ApexAction.execute=1",
            self.base_url
        ))
        .header("content-type", "application/x-www-form-urlencoded; charset=UTF-8")
        .header("accept", "*/*")
        .header("origin", self.base_url.as_str())
        .header("referer", format!("{}/member/s/find-care-search", self.base_url))
        .body(body)
    }
}

/// Action ids advance by two per page: 188, 190, 192, ...
pub(crate) fn listing_action_id(page: u32) -> u32 {
    188 + page.saturating_sub(1) * 2
}

/// Sequence number the site's own client would send around this page.
fn listing_rid(page: u32) -> u32 {
    let mut rng = rand::rng();
    let initial = rng.random_range(37..=42);
    let step = rng.random_range(4..=6);
    initial + page.saturating_sub(1) * step
}

/// Pull `IPResult` out of an Aura response envelope.
pub(crate) fn ip_result(response: &HttpResponse) -> Result<Value, Rejection> {
    // Aura sometimes prefixes JSON with an anti-hijacking guard.
    let body = response
        .body
        .find('{')
        .map(|start| &response.body[start..])
        .ok_or_else(|| Rejection::Retry("response body is not JSON".into()))?;
    let envelope: Value = serde_json::from_str(body)
        .map_err(|e| Rejection::Retry(format!("invalid aura envelope: {e}")))?;

    let actions = envelope
        .get("actions")
        .and_then(Value::as_array)
        .ok_or_else(|| Rejection::Retry("aura envelope without actions".into()))?;

    let mut states = Vec::new();
    for action in actions {
        let state = action.get("state").and_then(Value::as_str).unwrap_or("UNKNOWN");
        let Some(inner) = action.pointer("/returnValue/returnValue") else {
            states.push(state.to_string());
            continue;
        };
        if state != "SUCCESS" {
            states.push(state.to_string());
            continue;
        }

        let decoded = match inner {
            Value::String(raw) => serde_json::from_str::<Value>(raw)
                .map_err(|e| Rejection::Retry(format!("returnValue is not JSON: {e}")))?,
            other => other.clone(),
        };
        match decoded.get("IPResult") {
            Some(result) if !is_empty_result(result) => return Ok(result.clone()),
            _ => states.push("SUCCESS without IPResult".to_string()),
        }
    }

    Err(Rejection::Retry(format!(
        "no usable aura action ({})",
        states.join(", ")
    )))
}

fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl DirectoryApi for AuraDirectoryApi {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn listing_request(&self, job: &Job, cursor: &ListingCursor, token: CaptchaToken) -> HttpRequest {
        let input = json!({
            "lastName": "",
            "tenantId": TENANT_ID,
            "planId": "",
            "planType": job.plan.plan_type,
            "firstName": "",
            "ServiceType": job.service_type.as_str(),
            "networkId": "",
            "networkCode": job.plan.network_code,
            "distance": self.distance,
            "zipCode": job.zip_code,
            "providerSpeciality": job.specialty,
            "from": cursor.offset(self.page_size),
            "size": self.page_size,
            "fhn": "",
            "captchaResp": token.into_value(),
        });
        let body = self.form_body(listing_action_id(cursor.page_number), LISTING_METHOD, &input);
        self.post(listing_rid(cursor.page_number), body)
    }

    fn parse_listing(&self, response: &HttpResponse) -> Result<ListingPage, Rejection> {
        let payload = ip_result(response)?;
        let total_records = payload.get("totalRecords").and_then(as_count);
        let records = payload
            .get("providerList")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|entry| {
                        Some(ProviderRef {
                            id: entry.get("ProviderId").and_then(as_id)?,
                            name: entry
                                .get("providerFullName")
                                .and_then(Value::as_str)
                                .map(String::from),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ListingPage {
            records,
            total_records,
            payload,
        })
    }

    fn detail_request(
        &self,
        job: &Job,
        provider: &ProviderRef,
        token: Option<CaptchaToken>,
    ) -> HttpRequest {
        let mut input = json!({
            "providerId": provider.id,
            "tenantId": TENANT_ID,
            "planType": job.plan.plan_type,
            "networkCode": job.plan.network_code,
            "fhn": "",
            "ServiceType": job.service_type.as_str(),
            "providerSpeciality": "",
        });
        if let (Some(token), Some(map)) = (token, input.as_object_mut()) {
            map.insert("captchaResp".into(), Value::String(token.into_value()));
        }
        let body = self.form_body(DETAIL_ACTION_ID, DETAIL_METHOD, &input);
        let rid = rand::rng().random_range(43..=47);
        self.post(rid, body)
    }

    fn parse_detail(&self, response: &HttpResponse) -> Result<Value, Rejection> {
        ip_result(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Plan, ServiceType};

    fn api() -> AuraDirectoryApi {
        AuraDirectoryApi {
            base_url: "https://directory.example".into(),
            fwuid: "fwuid".into(),
            app_loaded: "1411_x".into(),
            page_size: 50,
            distance: "50mi".into(),
        }
    }

    fn job() -> Job {
        Job::new(
            "10001",
            Plan {
                plan_type: "HIP".into(),
                network_code: "D013".into(),
                coverage_type: "M".into(),
            },
            "Cardiology",
            ServiceType::Doctor,
        )
    }

    fn decode_form(body: &str) -> std::collections::HashMap<String, String> {
        form_urlencoded::parse(body.as_bytes()).into_owned().collect()
    }

    fn envelope(return_value: Value) -> HttpResponse {
        HttpResponse::new(
            200,
            json!({
                "actions": [{
                    "id": "188;a",
                    "state": "SUCCESS",
                    "returnValue": { "returnValue": return_value }
                }]
            })
            .to_string(),
        )
    }

    #[test]
    fn test_action_ids_advance_by_two() {
        assert_eq!(listing_action_id(1), 188);
        assert_eq!(listing_action_id(2), 190);
        assert_eq!(listing_action_id(5), 196);
    }

    #[test]
    fn test_listing_request_shape() {
        let mut cursor = ListingCursor::first();
        cursor.advance();
        let request = api().listing_request(&job(), &cursor, CaptchaToken::new("tok", "test"));

        assert!(request
            .url
            .starts_with("https://directory.example/member/s/sfsites/aura?r="));
        assert!(request.url.ends_with("&aura.ApexAction.execute=1"));

        let form = decode_form(request.body.as_deref().unwrap());
        assert_eq!(form["aura.pageURI"], "");
        assert_eq!(form["aura.token"], "null");

        let message: Value = serde_json::from_str(&form["message"]).unwrap();
        let action = &message["actions"][0];
        assert_eq!(action["id"], "190;a");
        assert_eq!(action["params"]["params"]["sMethodName"], LISTING_METHOD);

        let input: Value =
            serde_json::from_str(action["params"]["params"]["input"].as_str().unwrap()).unwrap();
        assert_eq!(input["from"], 50);
        assert_eq!(input["size"], 50);
        assert_eq!(input["captchaResp"], "tok");
        assert_eq!(input["ServiceType"], "Doctor");
        assert_eq!(input["zipCode"], "10001");

        let context: Value = serde_json::from_str(&form["aura.context"]).unwrap();
        assert_eq!(context["fwuid"], "fwuid");
    }

    #[test]
    fn test_parse_listing_from_string_return_value() {
        let inner = json!({
            "IPResult": {
                "totalRecords": "2",
                "providerList": [
                    {"ProviderId": "P1", "providerFullName": "Dr One"},
                    {"ProviderId": 2},
                    {"providerFullName": "No Id"}
                ]
            }
        });
        let page = api().parse_listing(&envelope(Value::String(inner.to_string()))).unwrap();
        assert_eq!(page.total_records, Some(2));
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].name.as_deref(), Some("Dr One"));
        assert_eq!(page.records[1].id, "2");
    }

    #[test]
    fn test_missing_ip_result_is_retryable() {
        let res = api().parse_listing(&envelope(json!({"IPResult": {}})));
        assert!(matches!(res, Err(Rejection::Retry(_))));

        let error = HttpResponse::new(
            200,
            json!({"actions": [{"state": "ERROR", "returnValue": null}]}).to_string(),
        );
        assert!(matches!(api().parse_listing(&error), Err(Rejection::Retry(_))));

        let html = HttpResponse::new(200, "<html>maintenance</html>");
        assert!(matches!(api().parse_detail(&html), Err(Rejection::Retry(_))));
    }

    #[test]
    fn test_guard_prefix_is_ignored() {
        let body = format!(
            "while(1);\n{}",
            json!({"actions": [{"state": "SUCCESS", "returnValue": {"returnValue": {"IPResult": {"id": 1}}}}]})
        );
        let detail = api().parse_detail(&HttpResponse::new(200, body)).unwrap();
        assert_eq!(detail["id"], 1);
    }

    #[test]
    fn test_detail_request_without_token() {
        let provider = ProviderRef {
            id: "P1".into(),
            name: None,
        };
        let request = api().detail_request(&job(), &provider, None);
        let form = decode_form(request.body.as_deref().unwrap());
        let message: Value = serde_json::from_str(&form["message"]).unwrap();
        let input: Value = serde_json::from_str(
            message["actions"][0]["params"]["params"]["input"].as_str().unwrap(),
        )
        .unwrap();
        assert_eq!(input["providerId"], "P1");
        assert!(input.get("captchaResp").is_none());
        assert_eq!(message["actions"][0]["id"], "198;a");
    }
}
