//! Typed Broadmail form calls.

use crate::{CallOutcome, DispatchResult, Dispatcher, RequestDescriptor};
use std::sync::Arc;

pub const FORM_ENDPOINT: &str = "form";
pub const RECIPIENT_ID_FIELD: &str = "bmRecipientId";
pub const OVERWRITE_FIELD: &str = "bmOverwrite";

/// Recipient-level calls against the `form` endpoint.
///
/// Each call injects the configured credential and the recipient address,
/// then goes through [`Dispatcher::submit`], so failures are queued like any
/// other call.
#[derive(Clone)]
pub struct BroadmailApi {
    dispatcher: Arc<Dispatcher>,
    credential: Option<String>,
}

impl BroadmailApi {
    pub fn new(dispatcher: Arc<Dispatcher>, credential: Option<String>) -> Self {
        Self {
            dispatcher,
            credential,
        }
    }

    pub async fn subscribe(&self, email: &str, fields: Vec<(String, String)>) -> DispatchResult<CallOutcome> {
        self.dispatcher
            .submit(self.form_request("subscribe", email, fields))
            .await
    }

    pub async fn unsubscribe(&self, email: &str, fields: Vec<(String, String)>) -> DispatchResult<CallOutcome> {
        self.dispatcher
            .submit(self.form_request("unsubscribe", email, fields))
            .await
    }

    pub async fn send_transaction_mail(
        &self,
        email: &str,
        fields: Vec<(String, String)>,
    ) -> DispatchResult<CallOutcome> {
        self.dispatcher
            .submit(self.form_request("sendtransactionmail", email, fields))
            .await
    }

    /// Update recipient fields. The API keeps existing values unless
    /// `overwrite` is set.
    pub async fn update_fields(
        &self,
        email: &str,
        fields: Vec<(String, String)>,
        overwrite: bool,
    ) -> DispatchResult<CallOutcome> {
        let mut request = self.form_request("updatefields", email, fields);
        if overwrite {
            request.set_field(OVERWRITE_FIELD, "true");
        }
        self.dispatcher.submit(request).await
    }

    fn form_request(&self, method: &str, email: &str, fields: Vec<(String, String)>) -> RequestDescriptor {
        let mut request = RequestDescriptor::new(FORM_ENDPOINT, method)
            .with_credential(self.credential.clone())
            .with_fields(fields);
        request.set_field(RECIPIENT_ID_FIELD, email);
        request
    }
}
