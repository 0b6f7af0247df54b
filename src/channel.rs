//! Transport of APDUs to the chip.

use std::time::Duration;

use crate::error::ChannelError;

/// A half-duplex link to a contactless chip: one command, one response.
pub trait CardChannel {
    /// Opens the link. Connecting an open channel is not an error.
    ///
    /// # Errors
    ///
    /// * `ChannelError` if the chip can not be reached.
    fn connect(&mut self) -> Result<(), ChannelError>;

    /// Sends a serialised command APDU and returns the response bytes,
    /// status word included.
    ///
    /// # Errors
    ///
    /// * `ChannelError::Timeout` if no response arrived within `timeout`.
    /// * `ChannelError` for any other transport failure.
    fn transmit(&mut self, command: &[u8], timeout: Duration) -> Result<Vec<u8>, ChannelError>;

    /// Closes the link.
    ///
    /// # Errors
    ///
    /// * `ChannelError` if the link could not be closed cleanly.
    fn disconnect(&mut self) -> Result<(), ChannelError>;
}

#[cfg(feature = "pcsc")]
pub use self::pcsc_channel::PcscChannel;

#[cfg(feature = "pcsc")]
mod pcsc_channel {
    use std::ffi::{CStr, CString};
    use std::time::Duration;

    use tracing::{debug, error};

    use super::CardChannel;
    use crate::error::ChannelError;

    /// A [`CardChannel`] over a PC/SC reader.
    ///
    /// PC/SC has no per-command timeout, the `timeout` given to
    /// [`CardChannel::transmit`] is left to the reader driver.
    pub struct PcscChannel {
        context: pcsc::Context,
        reader: CString,
        card: Option<pcsc::Card>,
    }

    impl PcscChannel {
        #[must_use]
        pub fn new(context: pcsc::Context, reader: &CStr) -> Self {
            Self {
                context,
                reader: reader.to_owned(),
                card: None,
            }
        }

        /// Uses the first reader of a new user scope context.
        ///
        /// # Errors
        ///
        /// * `ChannelError` if no context can be established or no reader is connected.
        pub fn first_reader() -> Result<Self, ChannelError> {
            let context = pcsc::Context::establish(pcsc::Scope::User).map_err(map_error)?;
            let mut readers_buf = [0; 2048];
            let reader = context
                .list_readers(&mut readers_buf)
                .map_err(map_error)?
                .next()
                .map(CStr::to_owned);
            let Some(reader) = reader else {
                error!("No readers are connected.");
                return Err(ChannelError::Disconnected);
            };
            debug!("Using reader: {reader:?}");
            Ok(Self {
                context,
                reader,
                card: None,
            })
        }

        /// Answer to reset of the connected card.
        ///
        /// # Errors
        ///
        /// * `ChannelError::Disconnected` if the channel is not connected.
        pub fn atr(&self) -> Result<Vec<u8>, ChannelError> {
            let card = self.card.as_ref().ok_or(ChannelError::Disconnected)?;
            card.get_attribute_owned(pcsc::Attribute::AtrString)
                .map_err(map_error)
        }
    }

    fn map_error(err: pcsc::Error) -> ChannelError {
        match err {
            pcsc::Error::Timeout => ChannelError::Timeout,
            pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard | pcsc::Error::ResetCard => {
                ChannelError::Disconnected
            }
            err => ChannelError::Pcsc(err),
        }
    }

    impl CardChannel for PcscChannel {
        fn connect(&mut self) -> Result<(), ChannelError> {
            if self.card.is_some() {
                return Ok(());
            }
            let card = self
                .context
                .connect(&self.reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)
                .map_err(|err| {
                    error!("Failed to connect to card: {err}");
                    map_error(err)
                })?;
            self.card = Some(card);
            Ok(())
        }

        fn transmit(&mut self, command: &[u8], _timeout: Duration) -> Result<Vec<u8>, ChannelError> {
            let card = self.card.as_ref().ok_or(ChannelError::Disconnected)?;
            let mut response_buffer = vec![0; pcsc::MAX_BUFFER_SIZE_EXTENDED];
            match card.transmit(command, &mut response_buffer) {
                Ok(response) => Ok(response.to_vec()),
                Err(err) => {
                    error!("Transmission failed: {err}");
                    Err(map_error(err))
                }
            }
        }

        fn disconnect(&mut self) -> Result<(), ChannelError> {
            let Some(card) = self.card.take() else {
                return Ok(());
            };
            card.disconnect(pcsc::Disposition::ResetCard)
                .map_err(|(_, err)| map_error(err))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_map_error() {
            assert!(matches!(map_error(pcsc::Error::Timeout), ChannelError::Timeout));
            for err in [
                pcsc::Error::NoSmartcard,
                pcsc::Error::RemovedCard,
                pcsc::Error::ResetCard,
            ] {
                assert!(matches!(map_error(err), ChannelError::Disconnected));
            }
            assert!(matches!(
                map_error(pcsc::Error::NoReadersAvailable),
                ChannelError::Pcsc(pcsc::Error::NoReadersAvailable)
            ));
        }
    }
}
