use std::{collections::BTreeMap, path::PathBuf, process::Stdio, sync::Arc};

use {
    anyhow::{Context, Result, bail},
    jobkit_cron::{Action, JobInvocation, OutputBuffer},
    serde::{Deserialize, Serialize},
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, BufReader},
        process::Command,
    },
    tracing::{debug, info},
};

use crate::expand::expand;

/// Runs a program with arguments, capturing its output into the invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellAction {
    /// Program followed by its arguments.
    pub exec: Vec<String>,
    /// Expand arguments from invocation parameters only, never from the
    /// process environment.
    pub skip_expand_env: bool,
    /// Do not capture output into the invocation.
    pub discard_output: bool,
    /// Do not log output lines.
    pub hide_output: bool,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl ShellAction {
    pub fn new(exec: Vec<String>) -> Self {
        Self {
            exec,
            ..Default::default()
        }
    }

    /// Wrap as a job action.
    #[must_use]
    pub fn into_action(self) -> Action {
        let shell = Arc::new(self);
        jobkit_cron::action(move |invocation| {
            let shell = Arc::clone(&shell);
            async move { shell.run(&invocation).await }
        })
    }

    /// The command line with parameters (and, unless disabled, environment
    /// variables) substituted. The program itself is never expanded.
    #[must_use]
    pub fn expanded_args(&self, invocation: &JobInvocation) -> Vec<String> {
        let params = invocation.parameters();
        let lookup = |name: &str| match params.get(name) {
            Some(value) => Some(value.clone()),
            None if self.skip_expand_env => None,
            None => std::env::var(name).ok(),
        };
        self.exec
            .iter()
            .enumerate()
            .map(|(i, arg)| if i == 0 { arg.clone() } else { expand(arg, lookup) })
            .collect()
    }

    pub async fn run(&self, invocation: &JobInvocation) -> Result<()> {
        let args = self.expanded_args(invocation);
        let Some((program, rest)) = args.split_first() else {
            bail!("no command to run");
        };
        debug!(program = %program, args = ?rest, "spawning command");

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .envs(&self.env)
            .envs(invocation.parameters())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start {program}"))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let output = (!self.discard_output).then(|| invocation.output());

        let run = async {
            let (status, out, err) = tokio::join!(
                child.wait(),
                pump(stdout, "stdout", output, self.hide_output),
                pump(stderr, "stderr", output, self.hide_output),
            );
            out?;
            err?;
            Ok::<_, anyhow::Error>(status?)
        };

        let status = tokio::select! {
            status = run => status?,
            () = invocation.cancel_token().cancelled() => bail!("cancelled"),
        };

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => bail!("command exited with status {code}"),
            None => bail!("command terminated by signal"),
        }
    }
}

/// Copy `stream` line by line into `output` and the log.
async fn pump<R>(
    stream: Option<R>,
    name: &'static str,
    output: Option<&OutputBuffer>,
    hide: bool,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return Ok(());
    };
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        if let Some(output) = output {
            output.write(&line);
        }
        if !hide {
            info!(stream = name, "{}", String::from_utf8_lossy(&line).trim_end());
        }
    }
}
