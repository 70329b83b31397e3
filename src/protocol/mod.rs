//! Wire-level conventions: topic filters, topic construction and payload codecs

pub mod codec;
pub mod topics;

pub use codec::{decode_with, encode_with, EncodingError, JsonCodec, PayloadCodec};
pub use topics::{
    default_status_topic, publish_topic, topic_matches, validate_agent_id, validate_filter,
    FilterError, ValidationError,
};
