use anyhow::Result;
use proxmed_core::{FieldKey, FormInstanceKey};
use serde::Deserialize;
use serde_json::Value;

use crate::envelope::Reply;
use crate::{Call, ProxmedApi};

#[derive(Debug, Deserialize)]
struct ValueInput {
    #[serde(flatten)]
    key: FieldKey,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RecordScope {
    project_id: i64,
    record_id: i64,
    event_id: Option<i64>,
}

impl ProxmedApi {
    pub(crate) fn set_value(&self, call: &Call) -> Result<Reply> {
        let ValueInput { key, value } = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let write = store.set_value(&key, &value, Some(caller.id))?;
        Reply::ok("Value saved successfully", write)
    }

    pub(crate) fn set_calculated_value(&self, call: &Call) -> Result<Reply> {
        let ValueInput { key, value } = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let write = store.set_calculated_value(&key, &value, Some(caller.id))?;
        Reply::ok("Calculated value saved successfully", write)
    }

    pub(crate) fn value(&self, call: &Call) -> Result<Reply> {
        let key: FieldKey = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        match store.get_value(&key)? {
            Some(value) => Reply::ok("Value retrieved successfully", value),
            None => Reply::ok("Value not set", Value::Null),
        }
    }

    pub(crate) fn values(&self, call: &Call) -> Result<Reply> {
        let scope: RecordScope = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        let values = store.get_values(scope.project_id, scope.record_id, scope.event_id)?;
        Reply::ok("Values retrieved successfully", values)
    }

    pub(crate) fn submit_form(&self, call: &Call) -> Result<Reply> {
        let key: FormInstanceKey = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let status = store.submit_form(&key, Some(caller.id), self.evaluator())?;
        Reply::ok("Form submitted successfully", status)
    }

    pub(crate) fn verify_form(&self, call: &Call) -> Result<Reply> {
        let key: FormInstanceKey = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let status = store.verify_form(&key, Some(caller.id))?;
        Reply::ok("Form verified successfully", status)
    }

    pub(crate) fn form_status(&self, call: &Call) -> Result<Reply> {
        let key: FormInstanceKey = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok("Form status retrieved successfully", store.form_status_view(&key)?)
    }

    pub(crate) fn form_statuses(&self, call: &Call) -> Result<Reply> {
        let RecordScope { project_id, record_id, .. } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok(
            "Form statuses retrieved successfully",
            store.list_form_statuses(project_id, record_id)?,
        )
    }
}
