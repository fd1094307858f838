// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// labelbridge-agent: the facade an HTTP front end embeds, plus the
// `labelbridge` binary.

pub mod services;

pub use services::agent_services::AgentServices;
