use thiserror::Error;
use tracing::trace;

use crate::iso7816::apdu;


#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("APDU write error: {0}")]
    Write(#[from] apdu::WriteError),

    #[cfg(feature = "pcsc")]
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    #[error("response too short")]
    ShortResponse,
}


/// A smart card compatible with ISO/IEC 7816.
pub trait SmartCard {
    /// Send a request APDU to the smart card and receive a response APDU.
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError>;
}
impl<T: SmartCard + ?Sized> SmartCard for &mut T {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }
}
impl<T: SmartCard + ?Sized> SmartCard for Box<T> {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }
}

#[cfg(feature = "pcsc")]
impl SmartCard for pcsc::Card {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        let out_buf = request.to_bytes()?;
        trace!(command = %crate::HexBytes(&out_buf), "sending to card");
        let mut in_buf = vec![0u8; request.data.expected_response_length().unwrap_or(0) + 2];
        let in_slice = self.transmit(&out_buf, &mut in_buf)?;
        trace!(response = %crate::HexBytes(in_slice), "received from card");
        apdu::Response::from_slice(in_slice)
            .ok_or(CommunicationError::ShortResponse)
    }
}


/// Logs a command/response pair at trace level.
pub(crate) fn trace_exchange(direction: &'static str, request: &apdu::Apdu, response: &apdu::Response) {
    if tracing::enabled!(tracing::Level::TRACE) {
        let command = request.to_bytes().unwrap_or_default();
        trace!(
            command = %crate::HexBytes(&command),
            response = %crate::HexBytes(&response.to_bytes()),
            "{} exchange",
            direction,
        );
    }
}
