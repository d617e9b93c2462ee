// Copyright 2025-2026 The sanweave authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]

//! # sanweave
//!
//! An AddressSanitizer-style binary instrumentation pass for already-compiled
//! 32-bit x86 Windows images. `sanweave` rewrites a block-graph representation of a
//! PE executable/DLL or COFF object so that every instrumentable memory access is
//! preceded by a call into a runtime library that performs shadow-memory validity
//! checks, and redirects a configurable set of CRT/system functions to runtime
//! interceptors.
//!
//! # Architecture
//!
//! - **Graph layer** ([`crate::graph`]): the block/reference data model, basic-block
//!   decomposition (iced-x86), an instruction assembler, a block builder that
//!   encodes edited subgraphs back into blocks, import/symbol plumbing and the
//!   content-hash block filter.
//! - **Pass layer** ([`crate::pass`]): operand classification, probe enumeration
//!   and import (with IAT bootstrap stubs), EFLAGS liveness and redundant-access
//!   analyses, the per-basic-block instrumenter, interceptor redirection, CRT
//!   heap-init patching, parameter embedding, and the pass driver.
//!
//! # Probe ABI
//!
//! Load/store probes receive the effective address in `EDX`: the emitted sequence
//! is `push edx; lea edx, <operand>; call <probe>`, and the probe restores `EDX`
//! and cleans up the 4-byte slot. String-instruction probes are called bare and
//! read `ESI`/`EDI` directly. On PE images probes are reached through IAT slots
//! that initially point at bootstrap stubs (the runtime's import descriptor is
//! stamped with timestamp 1 so the loader honors those slots until rebinding); on
//! COFF objects probes are direct symbol references.
//!
//! # Usage
//!
//! ```rust,no_run
//! use sanweave::{AsanTransform, AsanTransformConfig};
//! # fn load_graph() -> sanweave::graph::BlockGraph { unimplemented!() }
//!
//! let mut graph = load_graph();
//! let mut transform = AsanTransform::new(AsanTransformConfig {
//!     use_liveness_analysis: true,
//!     remove_redundant_checks: true,
//!     ..AsanTransformConfig::default()
//! });
//! transform.apply(&mut graph)?;
//! # Ok::<(), sanweave::Error>(())
//! ```

pub mod graph;
pub mod pass;

mod error;

pub use error::{Error, Result};
pub use pass::{AsanParameters, AsanTransform, AsanTransformConfig};
