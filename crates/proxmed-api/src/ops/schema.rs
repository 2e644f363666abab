use anyhow::Result;
use proxmed_core::{CreateFieldInput, CreateProjectInput, PageRequest, ProxmedError, UpdateProjectInput};
use serde::Deserialize;

use crate::envelope::Reply;
use crate::{Call, ProxmedApi};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ProjectIdInput {
    project_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UpdateProjectRequest {
    project_id: i64,
    input: UpdateProjectInput,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectsInput {
    page: Option<i64>,
    limit: Option<i64>,
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreateArmInput {
    project_id: i64,
    arm_num: u32,
    arm_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreateEventInput {
    project_id: i64,
    arm_id: i64,
    event_num: u32,
    event_name: String,
    offset_days: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EventsInput {
    project_id: i64,
    arm_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreateFormInput {
    project_id: i64,
    form_name: String,
    form_label: String,
    #[serde(default)]
    form_order: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreateFieldRequest {
    project_id: i64,
    field: CreateFieldInput,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FormIdInput {
    form_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AssignFormInput {
    project_id: i64,
    event_id: i64,
    form_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EventFormsInput {
    project_id: i64,
    event_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreateRecordInput {
    project_id: i64,
    record_key: String,
}

/// Either `recordId`, or `projectId` together with `recordKey`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RecordLookup {
    record_id: Option<i64>,
    project_id: Option<i64>,
    record_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RecordsInput {
    project_id: i64,
    page: Option<i64>,
    limit: Option<i64>,
}

impl ProxmedApi {
    pub(crate) fn create_project(&self, call: &Call) -> Result<Reply> {
        let input: CreateProjectInput = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let project = store.create_project(&input, Some(caller.id))?;
        Reply::ok("Project created successfully", project)
    }

    pub(crate) fn update_project(&self, call: &Call) -> Result<Reply> {
        let UpdateProjectRequest { project_id, input } = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let project = store.update_project(project_id, &input, Some(caller.id))?;
        Reply::ok("Project updated successfully", project)
    }

    pub(crate) fn project(&self, call: &Call) -> Result<Reply> {
        let ProjectIdInput { project_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        let project = store
            .get_project(project_id)?
            .ok_or_else(|| ProxmedError::not_found("Project not found"))?;
        Reply::ok("Project retrieved successfully", project)
    }

    pub(crate) fn projects(&self, call: &Call) -> Result<Reply> {
        let input: ProjectsInput = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        let page = store.list_projects(PageRequest::new(input.page, input.limit), input.search.as_deref())?;
        Reply::page("Projects retrieved successfully", page)
    }

    pub(crate) fn create_arm(&self, call: &Call) -> Result<Reply> {
        let input: CreateArmInput = call.input()?;
        let mut store = self.open_store()?;
        self.session(call, &store)?;
        let arm = store.create_arm(input.project_id, input.arm_num, &input.arm_name)?;
        Reply::ok("Arm created successfully", arm)
    }

    pub(crate) fn arms(&self, call: &Call) -> Result<Reply> {
        let ProjectIdInput { project_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok("Arms retrieved successfully", store.list_arms(project_id)?)
    }

    pub(crate) fn create_event(&self, call: &Call) -> Result<Reply> {
        let input: CreateEventInput = call.input()?;
        let mut store = self.open_store()?;
        self.session(call, &store)?;
        let event = store.create_event(
            input.project_id,
            input.arm_id,
            input.event_num,
            &input.event_name,
            input.offset_days,
        )?;
        Reply::ok("Event created successfully", event)
    }

    pub(crate) fn events(&self, call: &Call) -> Result<Reply> {
        let EventsInput { project_id, arm_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok("Events retrieved successfully", store.list_events(project_id, arm_id)?)
    }

    pub(crate) fn create_form(&self, call: &Call) -> Result<Reply> {
        let input: CreateFormInput = call.input()?;
        let mut store = self.open_store()?;
        self.session(call, &store)?;
        let form = store.create_form(input.project_id, &input.form_name, &input.form_label, input.form_order)?;
        Reply::ok("Form created successfully", form)
    }

    pub(crate) fn forms(&self, call: &Call) -> Result<Reply> {
        let ProjectIdInput { project_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok("Forms retrieved successfully", store.list_forms(project_id)?)
    }

    pub(crate) fn create_field(&self, call: &Call) -> Result<Reply> {
        let CreateFieldRequest { project_id, field } = call.input()?;
        let mut store = self.open_store()?;
        self.session(call, &store)?;
        let field = store.create_field(project_id, &field)?;
        Reply::ok("Field created successfully", field)
    }

    pub(crate) fn form_fields(&self, call: &Call) -> Result<Reply> {
        let FormIdInput { form_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        if store.get_form(form_id)?.is_none() {
            return Err(ProxmedError::not_found("Form not found").into());
        }
        Reply::ok("Fields retrieved successfully", store.list_form_fields(form_id)?)
    }

    pub(crate) fn assign_form_to_event(&self, call: &Call) -> Result<Reply> {
        let input: AssignFormInput = call.input()?;
        let mut store = self.open_store()?;
        self.session(call, &store)?;
        let assignment = store.assign_form_to_event(input.project_id, input.event_id, input.form_id)?;
        Reply::ok("Form assigned to event successfully", assignment)
    }

    pub(crate) fn event_forms(&self, call: &Call) -> Result<Reply> {
        let EventFormsInput { project_id, event_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok(
            "Event forms retrieved successfully",
            store.list_event_forms(project_id, event_id)?,
        )
    }

    pub(crate) fn create_record(&self, call: &Call) -> Result<Reply> {
        let input: CreateRecordInput = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let record = store.create_record(input.project_id, &input.record_key, Some(caller.id))?;
        Reply::ok("Record created successfully", record)
    }

    pub(crate) fn record(&self, call: &Call) -> Result<Reply> {
        let lookup: RecordLookup = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        let record = match lookup {
            RecordLookup { record_id: Some(record_id), .. } => store.get_record(record_id)?,
            RecordLookup { project_id: Some(project_id), record_key: Some(record_key), .. } => {
                store.get_record_by_key(project_id, &record_key)?
            }
            _ => {
                return Err(ProxmedError::validation(
                    "Provide recordId, or projectId with recordKey",
                )
                .into());
            }
        };
        let record = record.ok_or_else(|| ProxmedError::not_found("Record not found"))?;
        Reply::ok("Record retrieved successfully", record)
    }

    pub(crate) fn records(&self, call: &Call) -> Result<Reply> {
        let input: RecordsInput = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        let page = store.list_records(input.project_id, PageRequest::new(input.page, input.limit))?;
        Reply::page("Records retrieved successfully", page)
    }
}
