//! Helper scripts mounted at `/scripts` in every container.

use std::path::{Path, PathBuf};

use shipyard_util::fs::ensure_dir;

use crate::error::{io_err, EngineError};

const EMBEDDED: &[(&str, &str)] = &[
    ("persist", include_str!("../scripts/persist")),
    ("make-install", include_str!("../scripts/make-install")),
    ("make", include_str!("../scripts/make")),
    ("script", include_str!("../scripts/script")),
];

/// Write the embedded scripts into `<home>/scripts` and return that directory.
///
/// Files are only rewritten when their content differs; extra files placed
/// there by an operator (additional builders) are left alone.
///
/// # Errors
/// Returns an error if the directory or a script cannot be written.
pub fn materialise(home: &Path) -> Result<PathBuf, EngineError> {
    let dir = home.join("scripts");
    ensure_dir(&dir)?;
    for (name, content) in EMBEDDED {
        let path = dir.join(name);
        let current = std::fs::read_to_string(&path).ok();
        if current.as_deref() != Some(*content) {
            std::fs::write(&path, content).map_err(io_err(&path))?;
        }
    }
    Ok(dir)
}

/// Check that `builder` has a script in `scripts_dir`.
///
/// # Errors
/// Returns [`EngineError::BuilderNotFound`] if it does not.
pub fn require_builder(scripts_dir: &Path, builder: &str) -> Result<(), EngineError> {
    let valid_name = !builder.is_empty() && !builder.contains('/') && builder != "..";
    if valid_name && scripts_dir.join(builder).is_file() {
        Ok(())
    } else {
        Err(EngineError::BuilderNotFound {
            builder: builder.to_owned(),
        })
    }
}
