//! Core offer model shared by the store, sources, ingestion pipeline and API.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

pub const CRATE_NAME: &str = "jof-core";

/// Opaque identifier assigned by an offer store at persistence time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfferId(String);

impl OfferId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OfferId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for OfferId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An offer that has not been through a store yet. It has no id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOffer {
    pub company_name: String,
    pub position: String,
    pub salary: String,
    pub offer_url: String,
}

impl NewOffer {
    /// Offers without a url can never be persisted by ingestion.
    pub fn is_ingestible(&self) -> bool {
        !self.offer_url.is_empty()
    }

    /// Attach a store-assigned id. Only stores should call this.
    pub fn into_persisted(self, id: OfferId) -> Offer {
        Offer {
            id,
            company_name: self.company_name,
            position: self.position,
            salary: self.salary,
            offer_url: self.offer_url,
        }
    }
}

/// A persisted offer. `offer_url` is unique among all persisted offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub company_name: String,
    pub position: String,
    pub salary: String,
    pub offer_url: String,
}

/// Raw record as delivered by an external offer provider.
///
/// Providers disagree on naming, so both `company`/`companyName` and
/// `title`/`position` are accepted. Missing fields decode as empty strings;
/// an empty `offerUrl` is dropped later by the ingestion filter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOfferRecord {
    #[serde(default, alias = "company")]
    pub company_name: String,
    #[serde(default, alias = "title")]
    pub position: String,
    #[serde(default)]
    pub salary: String,
    #[serde(default)]
    pub offer_url: String,
}

impl JobOfferRecord {
    pub fn new(
        company_name: impl Into<String>,
        position: impl Into<String>,
        salary: impl Into<String>,
        offer_url: impl Into<String>,
    ) -> Self {
        Self {
            company_name: company_name.into(),
            position: position.into(),
            salary: salary.into(),
            offer_url: offer_url.into(),
        }
    }
}

impl From<JobOfferRecord> for NewOffer {
    fn from(record: JobOfferRecord) -> Self {
        Self {
            company_name: record.company_name,
            position: record.position,
            salary: record.salary,
            offer_url: record.offer_url,
        }
    }
}

/// Manual offer creation request accepted by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    #[validate(length(min = 1, message = "companyName must not be empty"))]
    pub company_name: String,
    #[validate(length(min = 1, message = "position must not be empty"))]
    pub position: String,
    #[validate(length(min = 1, message = "salary must not be empty"))]
    pub salary: String,
    #[validate(length(min = 1, message = "offerUrl must not be empty"))]
    pub offer_url: String,
}

impl OfferRequest {
    pub fn new(
        company_name: impl Into<String>,
        position: impl Into<String>,
        salary: impl Into<String>,
        offer_url: impl Into<String>,
    ) -> Self {
        Self {
            company_name: company_name.into(),
            position: position.into(),
            salary: salary.into(),
            offer_url: offer_url.into(),
        }
    }
}

impl From<OfferRequest> for NewOffer {
    fn from(request: OfferRequest) -> Self {
        Self {
            company_name: request.company_name,
            position: request.position,
            salary: request.salary,
            offer_url: request.offer_url,
        }
    }
}

/// Caller-facing view of a persisted offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferResponse {
    pub id: OfferId,
    pub company_name: String,
    pub position: String,
    pub salary: String,
    pub offer_url: String,
}

impl From<Offer> for OfferResponse {
    fn from(offer: Offer) -> Self {
        Self {
            id: offer.id,
            company_name: offer.company_name,
            position: offer.position,
            salary: offer.salary,
            offer_url: offer.offer_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_records_accept_both_field_spellings() {
        let short: JobOfferRecord = serde_json::from_str(
            r#"{"company":"Comarch","title":"Junior Rust Dev","salary":"7 000 - 9 000 PLN","offerUrl":"https://offers.example/1"}"#,
        )
        .unwrap();
        let long: JobOfferRecord = serde_json::from_str(
            r#"{"companyName":"Comarch","position":"Junior Rust Dev","salary":"7 000 - 9 000 PLN","offerUrl":"https://offers.example/1"}"#,
        )
        .unwrap();

        assert_eq!(short, long);
        assert_eq!(short.company_name, "Comarch");
        assert_eq!(short.position, "Junior Rust Dev");
    }

    #[test]
    fn missing_offer_url_decodes_as_not_ingestible() {
        let record: JobOfferRecord =
            serde_json::from_str(r#"{"company":"Acme","title":"Dev","salary":"1"}"#).unwrap();
        let offer = NewOffer::from(record);
        assert!(offer.offer_url.is_empty());
        assert!(!offer.is_ingestible());
    }

    #[test]
    fn response_uses_camel_case_and_keeps_id() {
        let offer = NewOffer {
            company_name: "Finanteq".into(),
            position: "Backend".into(),
            salary: "2000".into(),
            offer_url: "https://someother.example/6".into(),
        }
        .into_persisted(OfferId::from("abc"));

        let json = serde_json::to_value(OfferResponse::from(offer)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "abc",
                "companyName": "Finanteq",
                "position": "Backend",
                "salary": "2000",
                "offerUrl": "https://someother.example/6"
            })
        );
    }

    #[test]
    fn blank_request_fields_fail_validation() {
        let request = OfferRequest::new("", "position", "1000", "");
        let errors = request.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("company_name"));
        assert!(fields.contains_key("offer_url"));
        assert!(!fields.contains_key("salary"));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(OfferId::generate(), OfferId::generate());
    }
}
