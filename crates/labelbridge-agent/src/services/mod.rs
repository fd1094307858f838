// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer: the operations an HTTP front end calls, over the backend
// crates.

pub mod agent_services;
pub mod data_dir;
