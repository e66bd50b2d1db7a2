//! SDP data model, parser and serializer.

use thiserror::Error;

mod data;
pub use data::{
    Direction, MediaAttribute, MediaLine, MediaType, Proto, Sdp, Session, SessionAttribute, Setup,
    SsrcInfo,
};

mod parser;

/// Errors from handling SDP.
#[derive(Debug, Error)]
pub enum SdpError {
    #[error("SDP parse: {0}")]
    ParseError(String),

    #[error("SDP inconsistent: {0}")]
    Inconsistent(String),
}

impl Sdp {
    /// Parse an SDP document.
    pub fn parse(input: &str) -> Result<Sdp, SdpError> {
        use combine::EasyParser;

        let sdp = parser::sdp_parser()
            .easy_parse(input)
            .map(|(sdp, _)| sdp)
            .map_err(|e| SdpError::ParseError(e.to_string()))?;

        for m in &sdp.media_lines {
            if let Some(error) = m.check_consistent() {
                return Err(SdpError::Inconsistent(error));
            }
        }

        Ok(sdp)
    }
}
