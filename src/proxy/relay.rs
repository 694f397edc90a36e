//! Back-pressured pumping between the two legs of a session.

use crate::proxy::connection::{Connection, IoState};
use crate::proxy::session::{Effect, Failure};

/// Advances the `b` → `a` direction by one step.
///
/// Read `b` only while `a` is not writing, and write to `a` only what `b`
/// has already read. A fast producer therefore waits for the consumer's
/// write to complete before its buffer is reused, and TCP flow control does
/// the rest.
///
/// Must run after every read or write completion on either leg, once as
/// `(a, b)` and once as `(b, a)`.
pub fn cycle(a: &mut Connection, b: &mut Connection, effects: &mut Vec<Effect>) -> Result<(), Failure> {
    for conn in [&*a, &*b] {
        let status = conn.last_result();
        if status.is_failure() {
            return Err(Failure::Io {
                role: conn.role(),
                status,
            });
        }
    }

    a.settle_write();

    if a.write_state() == IoState::Stop {
        match b.read_state() {
            IoState::Stop => b.start_read(effects),
            IoState::Done => {
                let payload = b.lend_filled();
                a.write(payload, effects);
            }
            IoState::Busy | IoState::Dead => {}
        }
    }

    Ok(())
}
