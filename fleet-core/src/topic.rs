use serde::Serialize;

/// Minimum number of non-empty segments a telemetry topic must carry.
pub const MIN_SEGMENTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic has {found} non-empty segments, expected at least {MIN_SEGMENTS}")]
    TooFewSegments { found: usize },
}

/// A telemetry topic of the form `prefix/customer/location/machine/subtype[/...]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicPath {
    pub prefix: String,
    pub customer: String,
    pub location: String,
    pub machine: String,
    /// Everything after the fourth segment, rejoined with `/`.
    pub subtype: String,
}

impl TopicPath {
    /// Splits on `/`, ignoring empty segments (leading, trailing or doubled slashes).
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let segments: Vec<&str> = topic.split('/').filter(|s| !s.is_empty()).collect();

        let [prefix, customer, location, machine, rest @ ..] = segments.as_slice() else {
            return Err(TopicError::TooFewSegments {
                found: segments.len(),
            });
        };

        if rest.is_empty() {
            return Err(TopicError::TooFewSegments {
                found: segments.len(),
            });
        }

        Ok(Self {
            prefix: (*prefix).to_string(),
            customer: (*customer).to_string(),
            location: (*location).to_string(),
            machine: (*machine).to_string(),
            subtype: rest.join("/"),
        })
    }

    /// `customer/location/machine`, the device's place in the fleet.
    pub fn site(&self) -> String {
        format!("{}/{}/{}", self.customer, self.location, self.machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_five_segments() {
        let topic = TopicPath::parse("iot/acme/plant1/line3/status").unwrap();
        assert_eq!(topic.prefix, "iot");
        assert_eq!(topic.customer, "acme");
        assert_eq!(topic.location, "plant1");
        assert_eq!(topic.machine, "line3");
        assert_eq!(topic.subtype, "status");
        assert_eq!(topic.site(), "acme/plant1/line3");
    }

    #[test]
    fn joins_trailing_segments_into_subtype() {
        let topic = TopicPath::parse("iot/acme/plant1/line3/storage/raw/v2").unwrap();
        assert_eq!(topic.machine, "line3");
        assert_eq!(topic.subtype, "storage/raw/v2");
    }

    #[test]
    fn ignores_empty_segments() {
        let topic = TopicPath::parse("/iot//acme/plant1/line3/status/").unwrap();
        assert_eq!(topic.prefix, "iot");
        assert_eq!(topic.subtype, "status");
    }

    #[test]
    fn rejects_short_topics() {
        assert_eq!(
            TopicPath::parse("iot/acme/plant1/line3"),
            Err(TopicError::TooFewSegments { found: 4 })
        );
        assert_eq!(
            TopicPath::parse("iot/acme//plant1/line3//"),
            Err(TopicError::TooFewSegments { found: 4 })
        );
        assert_eq!(
            TopicPath::parse(""),
            Err(TopicError::TooFewSegments { found: 0 })
        );
    }
}
