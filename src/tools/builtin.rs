use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

use super::{Tool, ToolInvocation, split_words};
use crate::error::ProcessingError;
use crate::fits::{read_header, write_header};

/// In-process command set for simple file shuffling without an external
/// binary. One command per line; `#` starts a comment. Relative paths are
/// resolved against the working directory.
///
/// - `mkdir <dir>`
/// - `copy <src>... <dst>` (`dst` is a directory when several sources are given)
/// - `write <file> <text>...`
/// - `touch <file>`
/// - `stack <output> <input>...` writes a header-only FITS file carrying the
///   first input's header plus `NCOMBINE`
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTool;

impl Tool for BuiltinTool {
    fn name(&self) -> &str {
        "builtin"
    }

    fn run(&self, invocation: &ToolInvocation<'_>) -> Result<()> {
        let script = invocation.context.expand(invocation.script)?;
        for (number, line) in script.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let words = split_words(line)?;
            execute(&words, invocation.working_dir).map_err(|err| ProcessingError::ToolFailed {
                tool: self.name().to_string(),
                message: format!("line {}: {line}: {err:#}", number + 1),
            })?;
        }
        Ok(())
    }
}

fn resolve(dir: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn execute(words: &[String], dir: &Path) -> Result<()> {
    let Some((command, args)) = words.split_first() else {
        return Ok(());
    };
    debug!(command = %command, args = args.len(), "builtin");
    match command.as_str() {
        "mkdir" => {
            let [target] = args else {
                bail!("mkdir takes one directory");
            };
            let target = resolve(dir, target);
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?;
        }
        "copy" => {
            let Some((destination, sources)) = args.split_last() else {
                bail!("copy needs a source and a destination");
            };
            if sources.is_empty() {
                bail!("copy needs a source and a destination");
            }
            let destination = resolve(dir, destination);
            let into_dir = sources.len() > 1 || destination.is_dir();
            if into_dir {
                fs::create_dir_all(&destination).with_context(|| {
                    format!("Failed to create directory: {}", destination.display())
                })?;
            }
            for source in sources {
                let source = resolve(dir, source);
                let target = if into_dir {
                    let Some(name) = source.file_name() else {
                        bail!("Cannot copy {}", source.display());
                    };
                    destination.join(name)
                } else {
                    ensure_parent(&destination)?;
                    destination.clone()
                };
                fs::copy(&source, &target).with_context(|| {
                    format!("Failed to copy {} to {}", source.display(), target.display())
                })?;
            }
        }
        "write" => {
            let Some((target, text)) = args.split_first() else {
                bail!("write needs a file");
            };
            let target = resolve(dir, target);
            ensure_parent(&target)?;
            fs::write(&target, format!("{}\n", text.join(" ")))
                .with_context(|| format!("Failed to write {}", target.display()))?;
        }
        "touch" => {
            let [target] = args else {
                bail!("touch takes one file");
            };
            let target = resolve(dir, target);
            ensure_parent(&target)?;
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .with_context(|| format!("Failed to touch {}", target.display()))?;
        }
        "stack" => {
            let Some((output, inputs)) = args.split_first() else {
                bail!("stack needs an output and inputs");
            };
            let Some(first) = inputs.first() else {
                bail!("stack needs at least one input");
            };
            let mut cards: BTreeMap<String, String> = read_header(&resolve(dir, first))?;
            cards.insert("NCOMBINE".to_string(), inputs.len().to_string());
            let output = resolve(dir, output);
            ensure_parent(&output)?;
            write_header(&output, &cards)?;
        }
        other => bail!("Unknown builtin command '{other}'"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ProcessingContext, vars};
    use std::time::Duration;
    use tempfile::tempdir;

    fn run(script: &str, ctx: &ProcessingContext, dir: &Path) -> Result<()> {
        BuiltinTool.run(&ToolInvocation {
            stage: "test",
            script,
            context: ctx,
            working_dir: dir,
            timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn file_commands_work_relative_to_working_dir() {
        let temp = tempdir().unwrap();
        let ctx = ProcessingContext::new();
        run(
            "# prepare\nmkdir out\nwrite notes/a.txt hello world\ncopy notes/a.txt out\ntouch out/done\n",
            &ctx,
            temp.path(),
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(temp.path().join("out/a.txt")).unwrap(),
            "hello world\n"
        );
        assert!(temp.path().join("out/done").is_file());
    }

    #[test]
    fn stack_combines_headers() {
        let temp = tempdir().unwrap();
        let first = temp.path().join("a.fits");
        write_header(
            &first,
            &BTreeMap::from([("IMAGETYP".to_string(), "Bias".to_string())]),
        )
        .unwrap();
        std::fs::copy(&first, temp.path().join("b.fits")).unwrap();

        let mut ctx = ProcessingContext::new();
        ctx.set_paths(
            vars::INPUT_FILES,
            &[first.clone(), temp.path().join("b.fits")],
        );
        run("stack master.fits {input_files}", &ctx, temp.path()).unwrap();
        let header = read_header(&temp.path().join("master.fits")).unwrap();
        assert_eq!(header.get("NCOMBINE").map(String::as_str), Some("2"));
        assert_eq!(header.get("IMAGETYP").map(String::as_str), Some("Bias"));
    }

    #[test]
    fn unknown_command_names_the_line() {
        let temp = tempdir().unwrap();
        let err = run("explode now", &ProcessingContext::new(), temp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Unknown builtin command 'explode'"));
    }

    #[test]
    fn failing_command_is_a_tool_failure() {
        let temp = tempdir().unwrap();
        let err = run(
            "copy /nonexistent/frame.fits out.fits",
            &ProcessingContext::new(),
            temp.path(),
        )
        .unwrap_err();
        match crate::error::find_processing_error(&err) {
            Some(ProcessingError::ToolFailed { tool, message }) => {
                assert_eq!(tool, "builtin");
                assert!(message.starts_with("line 1: copy"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
