//! `forge init` -- write a task definition into `.forge/tasks/`.

use anyhow::{Result, bail};
use uuid::Uuid;

use forge_agent::criteria::{Criterion, CriterionConfig};
use forge_agent::state::TaskConfig;

use crate::config::{layout_at, workspace_root};
use crate::taskdef::{TaskDef, write_def};

pub fn run_init(prompt: &str, until: &[String], name: Option<&str>) -> Result<()> {
    let root = workspace_root()?;
    let layout = layout_at(&root);

    let name = name
        .map(str::to_owned)
        .unwrap_or_else(|| slugify(prompt));
    let id = format!("{name}-{}", &Uuid::new_v4().simple().to_string()[..8]);

    let mut config = TaskConfig::default();
    for (index, spec) in until.iter().enumerate() {
        config.criteria.push(parse_criterion(spec, index)?);
    }

    let def = TaskDef {
        id: Some(id.clone()),
        name,
        prompt: prompt.to_owned(),
        priority: None,
        config,
    };

    let path = write_def(&layout.tasks_dir(), &id, &def)?;
    println!("wrote {}", path.display());
    println!("queue it with: forge queue-tasks --task {id}");
    Ok(())
}

/// Parse an `--until` spec of the form `kind:value`.
///
/// - `file-exists:PATH`
/// - `file-contains:PATH:SUBSTRING`
/// - `promise:TEXT`
/// - `command:SHELL LINE`
/// - `test-pass` (optionally `test-pass:COMMAND`)
fn parse_criterion(spec: &str, index: usize) -> Result<Criterion> {
    let (kind, rest) = spec.split_once(':').unwrap_or((spec, ""));
    let name = format!("until-{index}");

    let config = match kind {
        "file-exists" => {
            if rest.is_empty() {
                bail!("file-exists needs a path: {spec:?}");
            }
            CriterionConfig::FileExists {
                path: rest.to_owned(),
            }
        }
        "file-contains" => {
            let Some((path, needle)) = rest.split_once(':') else {
                bail!("file-contains needs PATH:SUBSTRING: {spec:?}");
            };
            CriterionConfig::FileContains {
                path: path.to_owned(),
                substring: Some(needle.to_owned()),
                pattern: None,
            }
        }
        "promise" => {
            if rest.is_empty() {
                bail!("promise needs the expected text: {spec:?}");
            }
            CriterionConfig::Promise {
                text: rest.to_owned(),
            }
        }
        "command" => {
            if rest.is_empty() {
                bail!("command needs a shell line: {spec:?}");
            }
            CriterionConfig::Command {
                command: "sh".to_owned(),
                args: vec!["-c".to_owned(), rest.to_owned()],
                expected_exit_code: 0,
            }
        }
        "test-pass" => CriterionConfig::TestPass {
            command: (!rest.is_empty()).then(|| rest.to_owned()),
        },
        other => bail!("unknown criterion kind {other:?} in {spec:?}"),
    };

    Ok(Criterion {
        name,
        config,
        weight: 1,
        required: true,
        timeout_secs: 120,
    })
}

/// Lowercase alphanumeric slug of the first few words.
fn slugify(prompt: &str) -> String {
    let slug: String = prompt
        .split_whitespace()
        .take(5)
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "task".to_owned()
    } else {
        trimmed.chars().take(40).collect()
    }
}
