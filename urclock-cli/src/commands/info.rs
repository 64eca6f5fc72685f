//! Device info and port listing command implementations.

use {
    anyhow::Result,
    console::style,
    log::debug,
    urclock::{NativePort, NativePortEnumerator, PortEnumerator, Session, VectorLevel},
};

use crate::{Cli, config::Config};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports().unwrap_or_else(|e| {
        debug!("Port enumeration failed: {e}");
        Vec::new()
    });

    if json {
        let ports: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output)?
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available serial ports:")
            .bold()
            .underlined()
    );

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{vid_pid}{product}",
            style("*").green(),
            style(&port.name).cyan()
        );
    }

    Ok(())
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let mut session = super::open_session(cli, config)?;
    // Not every bootloader gives access to the board id
    let board_id = session
        .board_id()
        .map_err(|e| debug!("No board id: {e}"))
        .ok();

    if json {
        print_info_json(&session, board_id.map(|b| b.to_string()))?;
    } else {
        print_info(&session, board_id.map(|b| b.to_string()));
    }

    session.close()?;
    Ok(())
}

fn vector_level_name(level: VectorLevel) -> &'static str {
    match level {
        VectorLevel::None => "hardware boot section",
        VectorLevel::Jump => "reset patched by uploader",
        VectorLevel::Patch => "patched by bootloader",
        VectorLevel::PatchVerify => "patched and verified by bootloader",
    }
}

fn print_info(session: &Session<NativePort>, board_id: Option<String>) {
    let part = session.part();
    let geo = session.geometry();

    eprintln!(
        "\n{}",
        style("Device")
            .bold()
            .underlined()
    );
    eprintln!(
        "  Part:        {} (signature {:02X}{:02X}{:02X})",
        style(part.name).cyan(),
        part.signature[0],
        part.signature[1],
        part.signature[2]
    );
    eprintln!(
        "  Flash:       {} bytes, {} byte pages",
        part.flash_size, part.page_size
    );
    eprintln!("  EEPROM:      {} bytes", part.eeprom_size);
    if let Some(id) = board_id {
        eprintln!("  Board id:    {id}");
    }

    eprintln!(
        "\n{}",
        style("Bootloader")
            .bold()
            .underlined()
    );
    eprintln!("  Version:     {}", style(session.version_string()).green());
    eprintln!("  Protocol:    {}", session.dialect().name());
    match geo.start {
        Some(start) => eprintln!("  Location:    {start:#06x}, {} bytes", geo.size()),
        None => eprintln!("  Location:    {}", style("unknown").yellow()),
    }
    eprintln!(
        "  Vectors:     {} (vector {})",
        vector_level_name(geo.vector_level),
        geo.vector_number
    );
    eprintln!(
        "  EEPROM r/w:  {}",
        if session.eeprom_access() { "yes" } else { "no" }
    );

    eprintln!(
        "\n{}",
        style("Application")
            .bold()
            .underlined()
    );
    match session.metadata() {
        Some(meta) => {
            if let Some(name) = &meta.filename {
                eprintln!("  Last upload: {name}");
            }
            if let Some(date) = meta.date {
                eprintln!("  Date:        {date}");
            }
            eprintln!(
                "  Store:       {:#06x}, {} bytes",
                meta.store_start, meta.store_size
            );
        },
        None => eprintln!("  {}", style("No upload metadata").dim()),
    }
}

fn print_info_json(session: &Session<NativePort>, board_id: Option<String>) -> Result<()> {
    let part = session.part();
    let geo = session.geometry();
    let metadata = session
        .metadata()
        .map(|meta| {
            serde_json::json!({
                "filename": meta.filename,
                "date": meta.date.map(|d| d.to_string()),
                "store_start": meta.store_start,
                "store_size": meta.store_size,
            })
        });

    let output = serde_json::json!({
        "ok": true,
        "data": {
            "part": {
                "name": part.name,
                "signature": format!(
                    "{:02x}{:02x}{:02x}",
                    part.signature[0], part.signature[1], part.signature[2]
                ),
                "flash_size": part.flash_size,
                "page_size": part.page_size,
                "eeprom_size": part.eeprom_size,
            },
            "bootloader": {
                "version": session.version_string(),
                "protocol": session.dialect().name(),
                "start": geo.start,
                "size": geo.start.map(|_| geo.size()),
                "vector_level": geo.vector_level.level(),
                "vector_number": geo.vector_number,
                "eeprom_rw": session.eeprom_access(),
            },
            "board_id": board_id,
            "metadata": metadata,
        }
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&output)?
    );
    Ok(())
}
