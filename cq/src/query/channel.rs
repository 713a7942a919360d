//! Channel string encoding for query traffic
//!
//! Requests travel on `"<queryType>/<replyNodeAddress>"`, responses on the
//! literal `"response"` channel with correlation carried by the ssid.

use std::fmt;

use super::error::{QueryError, QueryResult};
use super::ssid::PeerName;

/// Channel used by every response message
pub const RESPONSE_CHANNEL: &str = "response";

const SEPARATOR: char = '/';

/// Inbound traffic classified by its channel string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel<'a> {
    Response,
    Request(&'a str),
}

impl<'a> Channel<'a> {
    /// Exactly `"response"` is a response; anything else is a request channel
    pub fn classify(channel: &'a str) -> Self {
        if channel == RESPONSE_CHANNEL {
            Channel::Response
        } else {
            Channel::Request(channel)
        }
    }
}

/// A decoded request channel: what is being asked and who to answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestChannel {
    pub query_type: String,
    pub reply_to: PeerName,
}

impl RequestChannel {
    pub fn new(query_type: impl Into<String>, reply_to: PeerName) -> QueryResult<Self> {
        let query_type = query_type.into();
        if query_type.contains(SEPARATOR) {
            return Err(QueryError::InvalidQueryType { query_type });
        }
        Ok(Self { query_type, reply_to })
    }

    /// Parse `"<queryType>/<replyNodeAddress>"`
    pub fn parse(channel: &str) -> QueryResult<Self> {
        let Some((query_type, reply)) = channel.split_once(SEPARATOR) else {
            return Err(QueryError::MalformedReplyAddress {
                channel: channel.to_string(),
                source: None,
            });
        };

        let reply_to = reply
            .parse::<u64>()
            .map_err(|e| QueryError::MalformedReplyAddress {
                channel: channel.to_string(),
                source: Some(e),
            })?;

        Ok(Self {
            query_type: query_type.to_string(),
            reply_to: PeerName(reply_to),
        })
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RequestChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.query_type, SEPARATOR, self.reply_to)
    }
}
