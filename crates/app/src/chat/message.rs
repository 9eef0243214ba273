use chrono::{DateTime, Utc};
use hearth_llm::Role;
use serde::{Deserialize, Serialize};

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    #[serde(default, deserialize_with = "nullable_content")]
    pub content: String,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_image_request: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            is_streaming: false,
            has_image_request: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Empty assistant turn that receives deltas while a generation runs.
    pub fn assistant_placeholder() -> Self {
        Self {
            is_streaming: true,
            ..Self::assistant(String::new())
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

fn nullable_content<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Ordered conversation history.
///
/// Append-only apart from dropping a trailing assistant turn and wholesale replacement.
/// At most one message carries `is_streaming`, and only while it is the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Message> {
        self.messages.get_mut(index)
    }

    pub fn push(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    /// Appends an assistant placeholder and returns its index.
    pub fn push_placeholder(&mut self) -> usize {
        self.push(Message::assistant_placeholder())
    }

    pub fn streaming_index(&self) -> Option<usize> {
        self.messages.iter().position(|message| message.is_streaming)
    }

    /// Removes the last message when it is a finished assistant turn.
    pub fn pop_trailing_assistant(&mut self) -> Option<Message> {
        match self.messages.last() {
            Some(last) if last.is_assistant() && !last.is_streaming => self.messages.pop(),
            _ => None,
        }
    }

    /// Messages that are eligible for prompts and exports.
    pub fn settled(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|message| !message.is_streaming)
    }

    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Clears leftover streaming flags and returns how many were reset.
    pub fn settle_all(&mut self) -> usize {
        let mut reset = 0;
        for message in self.messages.iter_mut().filter(|message| message.is_streaming) {
            message.is_streaming = false;
            reset += 1;
        }
        reset
    }
}

/// Timestamps are written as RFC 3339 and read back from RFC 3339 or epoch milliseconds.
/// Anything else reads as the current time.
pub(crate) mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::de::IgnoredAny;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Millis(i64),
        FractionalMillis(f64),
        Text(String),
        Other(IgnoredAny),
    }

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<RawTimestamp>::deserialize(deserializer)?;
        let parsed = match raw {
            None => None,
            Some(RawTimestamp::Millis(millis)) => DateTime::from_timestamp_millis(millis),
            Some(RawTimestamp::FractionalMillis(millis)) => {
                DateTime::from_timestamp_millis(millis as i64)
            }
            Some(RawTimestamp::Text(text)) => DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .map(|value| value.with_timezone(&Utc)),
            Some(RawTimestamp::Other(_)) => None,
        };

        Ok(parsed.unwrap_or_else(|| {
            tracing::debug!("unreadable message timestamp; using current time");
            Utc::now()
        }))
    }

    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }
}
