// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::commands::{load_fabric, Cli, HandledResult};

pub fn validate(cli: &Cli) -> HandledResult<()> {
    let fabric = load_fabric(cli)?;

    fabric.print_summary();

    Ok(())
}
