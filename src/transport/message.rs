use serde::{Deserialize, Serialize};

use crate::parser::record::{CounterInfos, CounterSample, TaskEvent, TelemetryRecord};

/// Record carried inside a [`Message::RegularData`] batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "data")]
pub enum DataRecord {
    CounterSample(CounterSample),
    TaskEvent(TaskEvent),
    PlainLine(String),
}

impl DataRecord {
    /// Converts a classified record into its wire form.
    ///
    /// Descriptions and run boundaries travel as dedicated messages and
    /// yield `None` here.
    pub fn from_record(record: TelemetryRecord) -> Option<Self> {
        match record {
            TelemetryRecord::CounterSample(s) => Some(Self::CounterSample(s)),
            TelemetryRecord::TaskEvent(t) => Some(Self::TaskEvent(t)),
            TelemetryRecord::PlainLine { text } => Some(Self::PlainLine(text)),
            TelemetryRecord::CounterDescription(_) | TelemetryRecord::RunBoundary { .. } => None,
        }
    }
}

impl From<DataRecord> for TelemetryRecord {
    fn from(r: DataRecord) -> Self {
        match r {
            DataRecord::CounterSample(s) => Self::CounterSample(s),
            DataRecord::TaskEvent(t) => Self::TaskEvent(t),
            DataRecord::PlainLine(text) => Self::PlainLine { text },
        }
    }
}

/// Transport message exchanged between agent and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "data")]
pub enum Message {
    /// A batch of records in arrival order.
    RegularData(Vec<DataRecord>),
    /// Start of a collection, seconds since the Unix epoch.
    TransmissionBegin(f64),
    /// End of a collection, seconds since the Unix epoch.
    TransmissionEnd(f64),
    /// Counter descriptions keyed by counter full name.
    CounterInfos(CounterInfos),
}

impl Message {
    /// Every tag the codec accepts.
    pub const TAGS: [&'static str; 4] = [
        "RegularData",
        "TransmissionBegin",
        "TransmissionEnd",
        "CounterInfos",
    ];

    /// Wire tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::RegularData(_) => "RegularData",
            Self::TransmissionBegin(_) => "TransmissionBegin",
            Self::TransmissionEnd(_) => "TransmissionEnd",
            Self::CounterInfos(_) => "CounterInfos",
        }
    }
}

/// Current wall-clock time as float seconds since the Unix epoch.
pub fn epoch_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_record_from_record() {
        let plain = DataRecord::from_record(TelemetryRecord::plain("hello"));
        assert_eq!(plain, Some(DataRecord::PlainLine("hello".to_string())));

        let boundary = TelemetryRecord::RunBoundary {
            boundary: crate::parser::record::BoundaryKind::End,
            timestamp: 1.0,
        };
        assert_eq!(DataRecord::from_record(boundary), None);
    }

    #[test]
    fn test_message_json_shape() {
        let json = serde_json::to_value(Message::TransmissionBegin(12.5)).expect("serialize");
        assert_eq!(json["tag"], "TransmissionBegin");
        assert_eq!(json["data"], 12.5);

        let batch = Message::RegularData(vec![DataRecord::PlainLine("x".to_string())]);
        let json = serde_json::to_value(&batch).expect("serialize");
        assert_eq!(json["data"][0]["tag"], "PlainLine");
        assert_eq!(json["data"][0]["data"], "x");
    }

    #[test]
    fn test_tag_listed() {
        for msg in [
            Message::RegularData(Vec::new()),
            Message::TransmissionBegin(0.0),
            Message::TransmissionEnd(0.0),
            Message::CounterInfos(CounterInfos::new()),
        ] {
            assert!(Message::TAGS.contains(&msg.tag()));
        }
    }

    #[test]
    fn test_epoch_seconds_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(epoch_seconds() > 1_577_836_800.0);
    }
}
