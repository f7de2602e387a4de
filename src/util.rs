use std::time::Duration;

use nom::IResult;
use pretty_hex::PrettyHex;
use tracing::{debug, trace};

use buffet::{ReadOwned, Roll, RollMut};

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReadAndParseError {
    /// Allocation error
    #[error("Allocation error: {0}")]
    Alloc(#[from] buffet::bufpool::Error),

    /// Read error
    #[error("Read error: {0}")]
    ReadError(#[from] std::io::Error),

    /// Nothing arrived within the idle timeout, while no partial input
    /// was buffered. This is an orderly way for a connection to end.
    #[error("Idle timeout reached while waiting for input")]
    IdleTimeout,

    /// The peer went quiet in the middle of something: bytes of the
    /// current item were already consumed and the rest never arrived.
    #[error("Read timeout reached mid-parse")]
    ReadTimeout,

    /// Buffer limit reached while parsing
    #[error("Buffer limit reached while parsing (limit: {limit})")]
    BufferLimitReachedWhileParsing { limit: usize },

    /// Parsing error
    #[error("Parsing error in parser: {parser}")]
    ParsingError { parser: &'static str },
}

/// Read deadlines for [read_and_parse]: `between_items` applies while the
/// buffer is empty and nothing has been consumed yet, `within_item` once
/// any byte of the current item is in hand. `None` disables the deadline.
#[derive(Clone, Copy)]
pub(crate) struct ReadTimeouts {
    pub(crate) between_items: Option<Duration>,
    pub(crate) within_item: Option<Duration>,
    /// true when the caller has already consumed part of the current item
    /// (e.g. a frame header) and this read is for its remainder
    pub(crate) starts_within: bool,
}

impl ReadTimeouts {
    /// Waiting for the start of the next item: `between` until the first
    /// byte shows up, `within` from then on.
    pub(crate) fn framing(between: Option<Duration>, within: Option<Duration>) -> Self {
        Self {
            between_items: between,
            within_item: within,
            starts_within: false,
        }
    }

    /// The current item is partially consumed already, every read counts
    /// as mid-item.
    pub(crate) fn mid_item(within: Option<Duration>) -> Self {
        Self {
            between_items: within,
            within_item: within,
            starts_within: true,
        }
    }
}

async fn read_with_timeout(
    stream: &mut impl ReadOwned,
    buf: RollMut,
    read_limit: usize,
    timeout: Option<Duration>,
    mid_item: bool,
) -> Result<(usize, RollMut), ReadAndParseError> {
    match timeout {
        None => {
            let (res, buf) = buf.read_into(read_limit, stream).await;
            Ok((res?, buf))
        }
        Some(timeout) => match tokio::time::timeout(timeout, buf.read_into(read_limit, stream))
            .await
        {
            Ok((res, buf)) => Ok((res?, buf)),
            Err(_elapsed) => {
                if mid_item {
                    Err(ReadAndParseError::ReadTimeout)
                } else {
                    Err(ReadAndParseError::IdleTimeout)
                }
            }
        },
    }
}

/// Returns `None` on EOF, error if partially parsed message.
pub(crate) async fn read_and_parse<Parser, Output>(
    parser_name: &'static str,
    parser: Parser,
    stream: &mut impl ReadOwned,
    mut buf: RollMut,
    max_len: usize,
    timeouts: ReadTimeouts,
) -> Result<Option<(RollMut, Output)>, ReadAndParseError>
where
    Parser: Fn(Roll) -> IResult<Roll, Output>,
{
    loop {
        trace!("Running parser (len={}, cap={})", buf.len(), buf.cap());
        let filled = buf.filled();

        match parser(filled) {
            Ok((rest, output)) => {
                buf.keep(rest);
                return Ok(Some((buf, output)));
            }
            Err(err) => {
                if err.is_incomplete() {
                    {
                        trace!(
                            "need more data. so far, we have:\n{:?}",
                            &buf[..std::cmp::min(buf.len(), 128)].hex_dump()
                        );
                    }

                    let read_limit = max_len - buf.len();
                    if buf.len() >= max_len {
                        return Err(ReadAndParseError::BufferLimitReachedWhileParsing {
                            limit: max_len,
                        });
                    }

                    if buf.cap() == 0 {
                        trace!("buf had zero cap, reserving");
                        buf.reserve()?;
                    }

                    let mid_item = timeouts.starts_within || !buf.is_empty();
                    let timeout = if mid_item {
                        timeouts.within_item
                    } else {
                        timeouts.between_items
                    };

                    trace!(
                        "Calling read_into (len={}, cap={}, read_limit={read_limit})",
                        buf.len(),
                        buf.cap(),
                    );
                    let n;
                    (n, buf) = read_with_timeout(stream, buf, read_limit, timeout, mid_item).await?;

                    if n == 0 {
                        if !buf.is_empty() {
                            return Err(ReadAndParseError::ReadError(
                                std::io::ErrorKind::UnexpectedEof.into(),
                            ));
                        } else {
                            return Ok(None);
                        }
                    }

                    continue;
                } else {
                    if let nom::Err::Error(e) = &err {
                        debug!(?err, "parsing error");
                        debug!(input = %e.input.to_string_lossy(), "input was");
                    }
                    return Err(ReadAndParseError::ParsingError {
                        parser: parser_name,
                    });
                }
            }
        };
    }
}
