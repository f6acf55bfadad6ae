use std::collections::BTreeSet;
use std::sync::Arc;

use gcode::GcodeLine;

/// A single item the engine can send to the firmware.
#[derive(Clone, Debug)]
pub enum CommandBody {
    Gcode(GcodeLine),
    AtCommand { name: String, parameters: String },
    Text(String),
}

impl CommandBody {
    pub fn to_line(&self) -> String {
        match self {
            CommandBody::Gcode(line) => line.to_string_spaced(),
            CommandBody::AtCommand { name, parameters } => {
                if parameters.is_empty() {
                    format!("@{}", name)
                } else {
                    format!("@{} {}", name, parameters)
                }
            }
            CommandBody::Text(line) => line.clone(),
        }
    }

    pub fn is_gcode(&self) -> bool {
        matches!(self, CommandBody::Gcode(_))
    }

    /// Numeric code of a G-code command (`M104` -> 104), if this is one.
    pub fn gcode_code(&self) -> Option<(char, i64)> {
        match self {
            CommandBody::Gcode(line) => Some((line.command().group, line.command().code())),
            _ => None,
        }
    }
}

/// A value-typed command: a body plus a dedup type and immutable tag
/// provenance set. `with_type`/`with_tags` return a new value, mirroring the
/// rest of the engine's "commands are values, pipeline phases rewrite by
/// replacement" design.
#[derive(Clone, Debug)]
pub struct Command {
    pub body: CommandBody,
    pub item_type: Option<String>,
    pub tags: Arc<BTreeSet<String>>,
}

impl Command {
    pub fn new(body: CommandBody) -> Self {
        Self {
            body,
            item_type: None,
            tags: Arc::new(BTreeSet::new()),
        }
    }

    pub fn gcode(line: GcodeLine) -> Self {
        Self::new(CommandBody::Gcode(line))
    }

    pub fn text(line: impl Into<String>) -> Self {
        Self::new(CommandBody::Text(line.into()))
    }

    pub fn with_type(mut self, item_type: impl Into<String>) -> Self {
        self.item_type = Some(item_type.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = (*self.tags).clone();
        set.extend(tags.into_iter().map(Into::into));
        self.tags = Arc::new(set);
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// A non-command sentinel enqueueable alongside commands.
pub enum QueueEntry {
    Command(Command),
    /// A barrier the send loop skips over without consuming a token slot.
    Marker,
    /// A barrier whose callback runs on the send-loop thread when reached,
    /// in order relative to the commands queued before it.
    SendQueueMarker(Box<dyn FnOnce() + Send>),
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueEntry::Command(c) => f.debug_tuple("Command").field(&c.body.to_line()).finish(),
            QueueEntry::Marker => write!(f, "Marker"),
            QueueEntry::SendQueueMarker(_) => write!(f, "SendQueueMarker"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_type_and_tags_are_immutable_builders() {
        let cmd = Command::text("M105")
            .with_type("temperature_poll")
            .with_tags(["source:timer"]);

        assert_eq!(cmd.item_type.as_deref(), Some("temperature_poll"));
        assert!(cmd.has_tag("source:timer"));

        let cmd2 = cmd.clone().with_tags(["trigger:user"]);
        assert!(cmd2.has_tag("source:timer"));
        assert!(cmd2.has_tag("trigger:user"));
        // Original is untouched.
        assert!(!cmd.has_tag("trigger:user"));
    }
}
