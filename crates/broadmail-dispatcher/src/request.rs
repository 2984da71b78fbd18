//! Replayable request descriptor.

use crate::DispatchResult;
use delivery_queue_database::ReplayPayload;
use serde::{Deserialize, Serialize};
use url::Url;

/// Literal put in place of the credential in logged URLs.
const REDACTED_CREDENTIAL: &str = "authCode";

/// Everything needed to perform, and later redo, one API call.
///
/// The credential travels with the descriptor so a queued call can be replayed
/// exactly as it was first attempted. It is sent as a path segment, never as a
/// form field.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    endpoint: String,
    method: String,
    #[serde(rename = "authCode", default, skip_serializing_if = "Option::is_none")]
    credential: Option<String>,
    #[serde(default)]
    fields: Vec<(String, String)>,
}

impl RequestDescriptor {
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            credential: None,
            fields: Vec::new(),
        }
    }

    pub fn with_credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential;
        self
    }

    /// Append a form field. Repeated keys are sent repeatedly.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = (String, String)>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Set a field so it appears exactly once, keeping its first position.
    pub fn set_field(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter().position(|(k, _)| k == key) {
            Some(index) => {
                self.fields[index].1 = value;
                let mut seen = 0;
                self.fields.retain(|(k, _)| {
                    if k != key {
                        return true;
                    }
                    seen += 1;
                    seen == 1
                });
            }
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The credential, if one is set and not blank.
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref().filter(|c| !c.trim().is_empty())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// `{base}/{endpoint}/{credential}/{method}`, or `None` without a credential.
    ///
    /// Each segment is percent-encoded, so a credential holding `/`, `?` or `#`
    /// stays one path segment.
    pub fn target_url(&self, base_url: &Url) -> Option<Url> {
        self.credential().map(|credential| self.url_with(base_url, credential))
    }

    /// The target URL with the credential segment replaced, safe to log.
    pub fn redacted_url(&self, base_url: &Url) -> String {
        self.url_with(base_url, REDACTED_CREDENTIAL).into()
    }

    fn url_with(&self, base_url: &Url, credential: &str) -> Url {
        let mut url = base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        // Cannot-be-a-base URLs are rejected by Dispatcher::new.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend([self.endpoint.as_str(), credential, self.method.as_str()]);
        }
        url
    }

    /// Serialize for storage in the delivery queue.
    pub fn encode(&self) -> DispatchResult<ReplayPayload> {
        Ok(ReplayPayload::new(serde_json::to_string(self)?))
    }

    pub fn decode(payload: &ReplayPayload) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload.as_str())
    }
}

impl std::fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("endpoint", &self.endpoint)
            .field("method", &self.method)
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .field("fields", &self.fields)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe_request() -> RequestDescriptor {
        RequestDescriptor::new("form", "subscribe")
            .with_credential(Some("S3CRET".to_string()))
            .field("bmRecipientId", "a@b.com")
            .field("firstname", "Ada")
    }

    fn base(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn test_target_and_redacted_urls() {
        let request = subscribe_request();
        assert_eq!(
            request.target_url(&base("https://api.broadmail.de/http/")).map(String::from).as_deref(),
            Some("https://api.broadmail.de/http/form/S3CRET/subscribe")
        );
        assert_eq!(
            request.redacted_url(&base("https://api.broadmail.de/http")),
            "https://api.broadmail.de/http/form/authCode/subscribe"
        );
        assert_eq!(
            request.redacted_url(&base("http://127.0.0.1:8080")),
            "http://127.0.0.1:8080/form/authCode/subscribe"
        );
    }

    #[test]
    fn test_reserved_characters_in_segments_are_encoded() {
        let request = RequestDescriptor::new("form", "send mail")
            .with_credential(Some("a/b?c#d".to_string()));
        let url = request.target_url(&base("https://api.broadmail.de/http")).unwrap();

        assert_eq!(
            url.as_str(),
            "https://api.broadmail.de/http/form/a%2Fb%3Fc%23d/send%20mail"
        );
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
        assert_eq!(url.path_segments().unwrap().count(), 4);
    }

    #[test]
    fn test_blank_credential_counts_as_missing() {
        let request = RequestDescriptor::new("form", "subscribe").with_credential(Some("  ".to_string()));
        assert!(request.credential().is_none());
        assert!(request.target_url(&base("http://localhost")).is_none());
    }

    #[test]
    fn test_debug_redacts_credential() {
        let debug = format!("{:?}", subscribe_request());
        assert!(!debug.contains("S3CRET"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_encoded_payload_keeps_credential_and_field_order() {
        let request = subscribe_request();
        let payload = request.encode().unwrap();
        let decoded = RequestDescriptor::decode(&payload).unwrap();

        assert_eq!(decoded, request);
        assert_eq!(decoded.credential(), Some("S3CRET"));
        assert_eq!(decoded.fields()[0].0, "bmRecipientId");
        assert_eq!(decoded.fields()[1].0, "firstname");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(RequestDescriptor::decode(&ReplayPayload::new("not json")).is_err());
    }

    #[test]
    fn test_set_field_replaces_all_occurrences() {
        let mut request = RequestDescriptor::new("form", "subscribe")
            .field("bmRecipientId", "old@b.com")
            .field("firstname", "Ada")
            .field("bmRecipientId", "dup@b.com");

        request.set_field("bmRecipientId", "new@b.com");

        assert_eq!(
            request.fields(),
            &[
                ("bmRecipientId".to_string(), "new@b.com".to_string()),
                ("firstname".to_string(), "Ada".to_string()),
            ]
        );

        request.set_field("bmOverwrite", "true");
        assert_eq!(request.fields().len(), 3);
        assert_eq!(request.fields()[2].0, "bmOverwrite");
    }
}
