//! Signaling connection and command framing
//!
//! The signaling connection is the indirect, always-available channel used
//! to exchange negotiation payloads before and while the direct path is
//! established.

pub mod client;
pub mod protocol;

pub use client::{SignalingClient, SignalingState};
pub use protocol::{
    AnswerSdpData, CloseCode, CommandEnvelope, IceCandidateData, OfferSdpData, OpenAckData,
    OpenCommandData, COMMAND_ANSWER_SDP, COMMAND_ICE_CANDIDATE, COMMAND_OFFER_SDP, COMMAND_OPEN,
};
