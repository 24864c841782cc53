use crate::schema::{DependentFetch, Entity, FieldError, Schema};
use serde::Serialize;
use std::sync::OnceLock;

/// Upper bound for `CONF_PARTICIPANTS_COUNT`; larger counts are rejected.
pub const MAX_CONFERENCE_PARTICIPANTS: u64 = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Call {
    /// Peer-assigned id; absent while the call is still pending locally.
    pub id: Option<String>,
    pub timestamp: Option<u64>,
    pub partner_handle: Option<String>,
    pub partner_display_name: Option<String>,
    pub target_identity: Option<String>,
    pub conference_id: Option<String>,
    pub call_type: Option<String>,
    pub status: Option<String>,
    pub video_status: Option<String>,
    pub video_send_status: Option<String>,
    pub video_receive_status: Option<String>,
    pub failure_reason: Option<u64>,
    pub subject: Option<String>,
    pub pstn_number: Option<String>,
    pub duration: Option<u64>,
    pub pstn_status: Option<String>,
    pub conference_participants_count: u64,
    pub conference_participants: Vec<Option<ConferenceParticipant>>,
    pub vm_duration: Option<u64>,
    pub vm_allowed_duration: Option<u64>,
    pub rate: Option<String>,
    pub rate_currency: Option<String>,
    pub rate_precision: Option<u64>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub capture_mic: Option<String>,
    pub vaa_input_status: Option<String>,
    pub forwarded_by: Option<String>,
    /// Handles dialled locally; only set on calls this client placed.
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConferenceParticipant {
    pub handle: String,
    pub call_type: Option<String>,
    pub status: Option<String>,
    pub display_name: Option<String>,
}

impl ConferenceParticipant {
    /// Parses `<index> <handle> [<type> [<status> [<display name...>]]]`.
    fn parse(raw: &str) -> Result<Self, FieldError> {
        let mut parts = raw.splitn(5, ' ').skip(1);
        let handle = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or(FieldError::Malformed)?;
        let mut next = || parts.next().map(str::to_string);
        Ok(Self {
            handle: handle.to_string(),
            call_type: next(),
            status: next(),
            display_name: next(),
        })
    }
}

impl Call {
    pub fn pending(targets: Vec<String>) -> Self {
        Self {
            targets,
            ..Self::default()
        }
    }

    pub fn with_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::default()
        }
    }

    fn set_participant_count(&mut self, count: u64) -> Result<Vec<DependentFetch>, FieldError> {
        if count > MAX_CONFERENCE_PARTICIPANTS {
            return Err(FieldError::TooLarge {
                value: count,
                max: MAX_CONFERENCE_PARTICIPANTS,
            });
        }
        if count == self.conference_participants_count {
            return Ok(Vec::new());
        }
        self.conference_participants_count = count;
        self.conference_participants = vec![None; count as usize];

        if count <= 1 {
            return Ok(Vec::new());
        }
        Ok((1..=count)
            .map(|index| DependentFetch {
                property: "CONF_PARTICIPANT",
                argument: index.to_string(),
            })
            .collect())
    }

    fn set_participant(&mut self, index: usize, raw: &str) -> Result<(), FieldError> {
        let len = self.conference_participants.len();
        let slot = index
            .checked_sub(1)
            .and_then(|i| self.conference_participants.get_mut(i))
            .ok_or(FieldError::OutOfRange { index, len })?;
        *slot = Some(ConferenceParticipant::parse(raw)?);
        Ok(())
    }
}

impl Entity for Call {
    const KIND: &'static str = "CALL";

    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<Call>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::<Call>::builder()
                .number("TIMESTAMP", |c, v| c.timestamp = Some(v))
                .text("PARTNER_HANDLE", |c, v| c.partner_handle = v)
                .text("PARTNER_DISPNAME", |c, v| c.partner_display_name = v)
                .text("TARGET_IDENTITY", |c, v| c.target_identity = v)
                .text("CONF_ID", |c, v| c.conference_id = v)
                .text("TYPE", |c, v| c.call_type = v)
                .text("STATUS", |c, v| c.status = v)
                .text("VIDEO_STATUS", |c, v| c.video_status = v)
                .text("VIDEO_SEND_STATUS", |c, v| c.video_send_status = v)
                .text("VIDEO_RECEIVE_STATUS", |c, v| c.video_receive_status = v)
                .number("FAILUREREASON", |c, v| c.failure_reason = Some(v))
                .text("SUBJECT", |c, v| c.subject = v)
                .text("PSTN_NUMBER", |c, v| c.pstn_number = v)
                .number("DURATION", |c, v| c.duration = Some(v))
                .text("PSTN_STATUS", |c, v| c.pstn_status = v)
                .count("CONF_PARTICIPANTS_COUNT", Call::set_participant_count)
                .indexed("CONF_PARTICIPANT", 0, Call::set_participant)
                .number("VM_DURATION", |c, v| c.vm_duration = Some(v))
                .number("VM_ALLOWED_DURATION", |c, v| c.vm_allowed_duration = Some(v))
                .text("RATE", |c, v| c.rate = v)
                .text("RATE_CURRENCY", |c, v| c.rate_currency = v)
                .number("RATE_PRECISION", |c, v| c.rate_precision = Some(v))
                .text("INPUT", |c, v| c.input = v)
                .text("OUTPUT", |c, v| c.output = v)
                .text("CAPTURE_MIC", |c, v| c.capture_mic = v)
                .text("VAA_INPUT_STATUS", |c, v| c.vaa_input_status = v)
                .text("FORWARDED_BY", |c, v| c.forwarded_by = v)
                .build()
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct User {
    pub handle: String,
    pub full_name: Option<String>,
    pub display_name: Option<String>,
    pub online_status: Option<String>,
    pub mood_text: Option<String>,
    pub authorized_contacts: Option<u64>,
}

impl User {
    pub fn new(handle: &str) -> Self {
        Self {
            handle: handle.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for User {
    const KIND: &'static str = "USER";

    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<User>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::<User>::builder()
                // The handle keys the registry; replies only echo it back.
                .text("HANDLE", |_, _| {})
                .text("ONLINESTATUS", |u, v| u.online_status = v)
                .number("NROF_AUTHED_BUDDIES", |u, v| u.authorized_contacts = Some(v))
                .text("FULLNAME", |u, v| u.full_name = v)
                .text("DISPLAYNAME", |u, v| u.display_name = v)
                .text("MOOD_TEXT", |u, v| u.mood_text = v)
                .build()
        })
    }
}
