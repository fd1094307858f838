// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// labelbridge-stream: remote job producers.
//
// The session manager keeps one tenant-scoped STOMP subscription alive and
// hands every delivered frame to the ingestion gateway.  The poller is the
// HTTP fallback for backends without a broker.

pub mod frame;
pub mod poller;
pub mod session;
pub mod transport;

pub use frame::{Command, Frame};
pub use poller::{HttpJobSource, JobPoller, JobSource};
pub use session::StreamSessionManager;
pub use transport::{StompWsTransport, StreamConnection, StreamTransport, TransportEvent};
