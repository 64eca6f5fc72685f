//! Upload, read and erase command implementations.

use {
    super::{ensure_not_interrupted, open_session, progress_bar},
    anyhow::{Context, Result},
    console::style,
    log::info,
    std::{fs, path::Path},
    urclock::{Memory, MemoryImage, TransformOptions, UploadSource},
};

use crate::{Cli, CliError, UploadArgs, config::Config};

/// Bytes read per request when dumping memory.
const READ_CHUNK: u32 = 1024;

/// Upload command implementation.
pub(crate) fn cmd_upload(cli: &Cli, config: &Config, args: &UploadArgs) -> Result<()> {
    let file = &args.file;
    // Fail before touching the device
    fs::metadata(file).with_context(|| format!("cannot read {}", file.display()))?;

    let mut session = open_session(cli, config)?;
    let part = session.part();
    let mut image = MemoryImage::from_file(file, part.flash_size)
        .with_context(|| format!("cannot load {}", file.display()))?;
    ensure_not_interrupted()?;

    if args.erase {
        session.chip_erase()?;
    }

    let opts = TransformOptions {
        restore: args.restore,
        nometadata: args.nometadata || config.upload.nometadata,
        nodate: args.nodate || config.upload.nodate,
        nofilename: args.nofilename || config.upload.nofilename,
        nostore: args.nostore,
        initstore: args.initstore,
        force: cli.force,
        title: args.title.clone(),
    };
    let source = UploadSource::from_path(file);
    let extent = session.transform_for_upload(&mut image, &opts, &source)?;
    info!("Application and metadata end at {extent:#06x}");

    let pb = progress_bar(cli, 0, "pages");
    let pages = session.upload(&image, &mut |done, total| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    })?;
    pb.finish_and_clear();
    session.close()?;

    if !cli.quiet {
        eprintln!(
            "{} Wrote {pages} pages ({} bytes) from {}",
            style("Done:").green().bold(),
            pages as u32 * part.page_size,
            file.display()
        );
    }
    Ok(())
}

/// Erase command implementation.
///
/// Bootloaders without a chip erase get their application flash
/// overwritten with 0xff instead.
pub(crate) fn cmd_erase(cli: &Cli, config: &Config) -> Result<()> {
    let mut session = open_session(cli, config)?;
    let emulated = session.chip_erase()?;

    if emulated {
        let flash = session.part().flash_size;
        let end = session.geometry().app_end();
        let mut blank = MemoryImage::new(flash);
        blank.tag(0..end);

        let pb = progress_bar(cli, 0, "pages");
        session.upload(&blank, &mut |done, total| {
            pb.set_length(total as u64);
            pb.set_position(done as u64);
        })?;
        pb.finish_and_clear();
    }
    session.close()?;

    if !cli.quiet {
        eprintln!(
            "{} Application flash erased{}",
            style("Done:").green().bold(),
            if emulated { " (emulated)" } else { "" }
        );
    }
    Ok(())
}

/// Read command implementation.
pub(crate) fn cmd_read(
    cli: &Cli,
    config: &Config,
    mem: Memory,
    output: &Path,
    address: u32,
    length: Option<u32>,
) -> Result<()> {
    let mut session = open_session(cli, config)?;
    let size = match mem {
        Memory::Flash => session.part().flash_size,
        Memory::Eeprom => session.part().eeprom_size,
    };
    if address >= size {
        return Err(CliError::Usage(format!(
            "address {address:#06x} is outside {} of {size} bytes",
            mem.name()
        ))
        .into());
    }
    let len = length.unwrap_or(size - address);
    if len == 0 || address.checked_add(len).is_none_or(|end| end > size) {
        return Err(CliError::Usage(format!(
            "cannot read {len} bytes from {} at {address:#06x}",
            mem.name()
        ))
        .into());
    }

    let mut data = vec![0u8; len as usize];
    let pb = progress_bar(cli, u64::from(len), "bytes");
    let mut done = 0;
    for chunk in data.chunks_mut(READ_CHUNK as usize) {
        ensure_not_interrupted()?;
        session.paged_read(mem, address + done, chunk)?;
        done += chunk.len() as u32;
        pb.set_position(u64::from(done));
    }
    pb.finish_and_clear();
    session.close()?;

    fs::write(output, &data).with_context(|| format!("cannot write {}", output.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} Read {len} bytes of {} into {}",
            style("Done:").green().bold(),
            mem.name(),
            output.display()
        );
    }
    Ok(())
}
