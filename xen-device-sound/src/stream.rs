// Manos Pitsidianakis <manos.pitsidianakis@linaro.org>
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use thiserror::Error as ThisError;

use crate::{
    dispatcher::CommandDispatcher,
    sndif::{XenSndReq, XenSndResp},
    xen::RequestRing,
    Result as CrateResult,
};

/// Stream errors.
#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    #[error("Frontend requested an invalid stream state transition from {0} to {1}.")]
    InvalidStateTransition(StreamState, StreamState),
}

type Result<T> = std::result::Result<T, Error>;

/// Stream state machine.
///
/// - `OPEN` moves a closed stream to `Opened`. Playback data may be written
///   from then on to pre-buffer.
/// - `TRIGGER(START)` runs an opened or stopped stream.
/// - `TRIGGER(PAUSE)` and `TRIGGER(RESUME)` toggle a running stream.
/// - `TRIGGER(STOP)` is accepted in every open state.
/// - `CLOSE` is accepted in every state.
///
/// ```text
///            OPEN            START            PAUSE
/// Closed ---------> Opened ---------> Running ------> Paused
///                     |                 ^  |  <------   |
///                     | STOP      START |  |  RESUME    |
///                     v                 |  v STOP       | STOP
///                   Stopped <-----------+--+------------+
/// ```
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    #[doc(alias = "XENSND_OP_CLOSE")]
    Closed,
    #[doc(alias = "XENSND_OP_OPEN")]
    Opened,
    #[doc(alias = "XENSND_OP_TRIGGER_START")]
    Running,
    #[doc(alias = "XENSND_OP_TRIGGER_PAUSE")]
    Paused,
    #[doc(alias = "XENSND_OP_TRIGGER_STOP")]
    Stopped,
}

macro_rules! set_new_state {
    ($new_state_fn:ident, $new_state:expr, $($valid_source_states:tt)*) => {
        pub fn $new_state_fn(&mut self) -> Result<()> {
            if !matches!(self, $($valid_source_states)*) {
                return Err(Error::InvalidStateTransition(*self, $new_state));
            }
            *self = $new_state;
            Ok(())
        }
    };
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn is_open(&self) -> bool {
        !matches!(self, Self::Closed)
    }

    set_new_state!(open, Self::Opened, Self::Closed);

    set_new_state!(start, Self::Running, Self::Opened | Self::Stopped);

    set_new_state!(pause, Self::Paused, Self::Running);

    set_new_state!(resume, Self::Running, Self::Paused);

    set_new_state!(
        stop,
        Self::Stopped,
        Self::Opened | Self::Running | Self::Paused | Self::Stopped
    );

    set_new_state!(close, Self::Closed, _);
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        use StreamState::*;
        match *self {
            Closed => {
                write!(fmt, "XENSND_OP_CLOSE")
            }
            Opened => {
                write!(fmt, "XENSND_OP_OPEN")
            }
            Running => {
                write!(fmt, "XENSND_OP_TRIGGER_START")
            }
            Paused => {
                write!(fmt, "XENSND_OP_TRIGGER_PAUSE")
            }
            Stopped => {
                write!(fmt, "XENSND_OP_TRIGGER_STOP")
            }
        }
    }
}

/// Serves the request ring of one guest stream.
///
/// Requests are handled strictly one at a time and each gets exactly one
/// response, in order.
pub struct StreamChannel {
    name: String,
    dispatcher: CommandDispatcher,
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(StreamChannel))
            .field("name", &self.name)
            .field("state", &self.dispatcher.state())
            .finish_non_exhaustive()
    }
}

impl StreamChannel {
    pub fn new(name: impl Into<String>, dispatcher: CommandDispatcher) -> Self {
        Self {
            name: name.into(),
            dispatcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process_request(&mut self, req: &XenSndReq) -> XenSndResp {
        log::trace!(
            "{}: request id {} operation {}",
            self.name,
            u16::from(req.id),
            req.operation
        );
        let reply = self.dispatcher.process(req);
        let mut resp = XenSndResp {
            id: req.id,
            operation: req.operation,
            ..XenSndResp::default()
        };
        resp.set_status(reply.status);
        if let Some(hw_param) = reply.hw_param {
            resp.set_payload(&hw_param);
        }
        resp
    }

    /// Serve `ring` until the frontend closes it, then close the stream.
    pub fn run(&mut self, ring: &mut dyn RequestRing) -> CrateResult<()> {
        log::debug!("{}: serving requests", self.name);
        while let Some(req) = ring.next_request() {
            let resp = self.process_request(&req);
            if let Err(err) = ring.send_response(&resp) {
                log::error!("{}: could not send response: {}", self.name, err);
                self.shutdown();
                return Err(err);
            }
        }
        log::debug!("{}: request ring closed", self.name);
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.dispatcher.close() {
            log::error!("{}: could not close stream: {}", self.name, err);
        }
    }
}
