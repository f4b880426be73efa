// SPDX-License-Identifier: CEPL-1.0
//! Windowing stack for the host application. The renderer crates never depend on this;
//! they only see raw window/display handles.
pub use winit;
