use jobgate::{
    EventId, HttpSpec, JobPayload, JobType, NewJob, RetryPolicy, ScriptKind, ScriptSpec, ToolSpec,
    UserId,
};

/// Builder for job creation requests used across tests.
#[derive(Clone, Debug)]
pub struct JobFixture {
    request: NewJob,
}

impl JobFixture {
    /// A bash script job that echoes a line.
    pub fn script(user_id: UserId) -> Self {
        Self::with_payload(
            user_id,
            JobType::Script,
            JobPayload {
                script: Some(ScriptSpec {
                    kind: ScriptKind::Bash,
                    content: "echo hello".to_string(),
                    working_directory: None,
                }),
                ..Default::default()
            },
        )
    }

    /// A `GET` against `url`.
    pub fn http(user_id: UserId, url: &str) -> Self {
        Self::with_payload(
            user_id,
            JobType::HttpRequest,
            JobPayload {
                http: Some(HttpSpec {
                    method: "GET".to_string(),
                    url: url.to_string(),
                    headers: Default::default(),
                    body: None,
                }),
                ..Default::default()
            },
        )
    }

    /// A tool action with an empty config object.
    pub fn tool(user_id: UserId, tool: &str, action: &str) -> Self {
        Self::with_payload(
            user_id,
            JobType::ToolAction,
            JobPayload {
                tool: Some(ToolSpec {
                    tool: tool.to_string(),
                    action: action.to_string(),
                    config: serde_json::json!({}),
                }),
                ..Default::default()
            },
        )
    }

    fn with_payload(user_id: UserId, job_type: JobType, payload: JobPayload) -> Self {
        Self {
            request: NewJob {
                event_id: EventId::new(),
                user_id,
                job_type,
                payload,
                metadata: Default::default(),
            },
        }
    }

    /// Attributes the job to a specific event instead of a random one.
    pub fn event(mut self, event_id: EventId) -> Self {
        self.request.event_id = event_id;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.request.payload.timeout_secs = Some(secs);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.request.payload.retry = RetryPolicy { max_attempts };
        self
    }

    pub fn metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.request.metadata.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> NewJob {
        self.request
    }
}

/// Shorthand for the most common fixture.
pub fn script_job(user_id: UserId) -> NewJob {
    JobFixture::script(user_id).build()
}
