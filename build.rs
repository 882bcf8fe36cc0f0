//! Build script rendering the `droidprov` manual pages.
//!
//! One page is produced for the top-level command and one per subcommand
//! (`droidprov-watch.1`, `droidprov-devices.1`), all in `OUT_DIR` where the
//! packaging step picks them up.

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(man: Man, out_dir: &Path, file_name: &str) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    std::fs::write(out_dir.join(file_name), buffer)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set"))?;

    let command = Cli::command();
    for sub in command.get_subcommands() {
        let title = format!("droidprov-{}", sub.get_name());
        let file_name = format!("{title}.1");
        render(Man::new(sub.clone()).title(title), &out_dir, &file_name)?;
    }
    render(Man::new(command), &out_dir, "droidprov.1")?;

    Ok(())
}
