//! Remote clock offset estimation.
//!
//! Offsets are measured with the remote clock reading technique: assuming
//! the request and the response spend the same time on the wire, the peer's
//! clock at the moment the response arrives is its reported time plus half
//! the round trip. The true offset then lies in `[offset - error, offset + error]`
//! with `error` equal to half the round trip.

use serde::{Deserialize, Serialize};

/// Estimated offset of a peer's clock from the local clock.
///
/// All fields are nanoseconds. A positive `offset` means the peer's clock
/// is ahead of ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteOffset {
    /// Estimated offset from the remote clock
    pub offset: i64,
    /// Maximum error of the estimate (half the measured round trip)
    pub error: i64,
    /// Local time of the measurement, since the Unix epoch
    pub measured_at: i64,
}

impl RemoteOffset {
    /// Offset used when a heartbeat times out: no valid estimate.
    pub const INFINITE: RemoteOffset = RemoteOffset {
        offset: i64::MAX,
        error: 0,
        measured_at: 0,
    };

    /// The infinite sentinel stamped with the time it was recorded.
    pub fn infinite(measured_at: i64) -> Self {
        Self {
            measured_at,
            ..Self::INFINITE
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.offset == i64::MAX && self.error == 0
    }

    /// Estimate the offset from one request/response exchange.
    ///
    /// `send_time` and `receive_time` are local clock readings taken around
    /// the call; `server_time` is the peer's clock reading from the response.
    /// A wall clock stepping back between the readings counts as a zero
    /// round trip, so `error` is never negative.
    pub fn measure(send_time: i64, receive_time: i64, server_time: i64) -> Self {
        let half_round_trip = receive_time.saturating_sub(send_time).max(0) / 2;
        let remote_time_now = server_time.saturating_add(half_round_trip);

        Self {
            offset: remote_time_now.saturating_sub(receive_time),
            error: half_round_trip,
            measured_at: receive_time,
        }
    }

    /// The same estimate seen from the peer's side.
    pub fn reciprocal(&self) -> Self {
        if self.is_infinite() {
            return *self;
        }
        Self {
            offset: self.offset.saturating_neg(),
            ..*self
        }
    }
}
