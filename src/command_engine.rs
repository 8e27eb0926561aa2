//! Subprocess crypto engine driving the `openssl` command-line tool
//!
//! Each operation is one `openssl` invocation that consumes the rendered
//! configuration file named by [`ConfigRef::path`]. The caller must have
//! written the rendered text there before calling the engine.
//!
//! Every invocation runs with a bounded wait. A child that outlives the
//! timeout is killed and the stage fails. Passphrases travel through the
//! child's environment (`-passin env:` / `-passout env:`), never through argv.

use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::crypto_engine::{
    CertHandle, ConfigRef, CryptoEngine, CsrHandle, EngineError, EngineResult, EngineStage,
    ExtensionsRef, KeyHandle,
};
use crate::passphrase::Passphrase;

const PASSPHRASE_ENV: &str = "LOCAL_CA_KEY_PASSPHRASE";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn run(
        &self,
        stage: EngineStage,
        args: Vec<OsString>,
        passphrase: Option<&Passphrase>,
    ) -> EngineResult<()> {
        debug!(program = %self.program.display(), %stage, ?args, "invoking engine");

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(pass) = passphrase {
            command.env(PASSPHRASE_ENV, pass.expose());
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                EngineError::new(
                    stage,
                    format!("command '{}' not found", self.program.display()),
                )
            } else {
                EngineError::new(stage, format!("failed to start '{}': {}", self.program.display(), e))
            }
        })?;

        // drain stderr concurrently so a chatty child cannot block on a full pipe
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buffer = String::new();
                let _ = stderr.read_to_string(&mut buffer);
                buffer
            })
        });

        let status = wait_with_deadline(&mut child, self.timeout).map_err(EngineError::at(stage))?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        match status {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(EngineError::new(
                stage,
                format!("openssl exited with {}: {}", status, stderr.trim()),
            )),
            None => Err(EngineError::new(
                stage,
                format!("timed out after {}s", self.timeout.as_secs_f32()),
            )),
        }
    }
}

/// Wait for `child` until `timeout`; kill it and return `None` on expiry
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            warn!(pid = child.id(), "engine timed out, killing child");
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn passin_args(key: &KeyHandle, flag: &str) -> Vec<OsString> {
    match key.passphrase {
        Some(_) => vec![flag.into(), format!("env:{PASSPHRASE_ENV}").into()],
        None => Vec::new(),
    }
}

fn genrsa_args(bits: u32, encrypted: bool, out: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["genrsa".into()];
    if encrypted {
        args.push("-aes256".into());
        args.push("-passout".into());
        args.push(format!("env:{PASSPHRASE_ENV}").into());
    }
    args.push("-out".into());
    args.push(out.into());
    args.push(bits.to_string().into());
    args
}

fn self_signed_args(key: &KeyHandle, config: &Path, days: u32, out: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "req".into(),
        "-x509".into(),
        "-new".into(),
        "-config".into(),
        config.into(),
        "-key".into(),
        key.path.clone().into(),
    ];
    args.extend(passin_args(key, "-passin"));
    args.append(&mut vec![
        "-sha256".into(),
        "-days".into(),
        days.to_string().into(),
        "-out".into(),
        out.into(),
    ]);
    args
}

fn csr_args(key: &KeyHandle, config: &Path, out: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "req".into(),
        "-new".into(),
        "-sha256".into(),
        "-key".into(),
        key.path.clone().into(),
    ];
    args.extend(passin_args(key, "-passin"));
    args.append(&mut vec![
        "-out".into(),
        out.into(),
        "-config".into(),
        config.into(),
    ]);
    args
}

fn sign_args(
    csr: &CsrHandle,
    issuer_cert: &CertHandle,
    issuer_key: &KeyHandle,
    extensions: &ExtensionsRef<'_>,
    days: u32,
    out: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "x509".into(),
        "-req".into(),
        "-in".into(),
        csr.path.clone().into(),
        "-CA".into(),
        issuer_cert.path.clone().into(),
        "-CAkey".into(),
        issuer_key.path.clone().into(),
    ];
    args.extend(passin_args(issuer_key, "-passin"));
    args.append(&mut vec![
        "-CAcreateserial".into(),
        "-out".into(),
        out.into(),
        "-extensions".into(),
        extensions.section.into(),
        "-extfile".into(),
        extensions.config.path.into(),
        "-days".into(),
        days.to_string().into(),
        "-sha256".into(),
    ]);
    args
}

impl CryptoEngine for CommandEngine {
    fn generate_key(
        &self,
        bits: u32,
        passphrase: Option<&Passphrase>,
        out: &Path,
    ) -> EngineResult<KeyHandle> {
        let stage = EngineStage::GenerateKey;
        self.run(stage, genrsa_args(bits, passphrase.is_some(), out), passphrase)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(out, std::fs::Permissions::from_mode(0o600))
                .map_err(EngineError::at(stage))?;
        }
        Ok(KeyHandle::new(out, passphrase.cloned()))
    }

    fn generate_self_signed_cert(
        &self,
        key: &KeyHandle,
        config: ConfigRef<'_>,
        validity_days: u32,
        out: &Path,
    ) -> EngineResult<CertHandle> {
        self.run(
            EngineStage::SelfSign,
            self_signed_args(key, config.path, validity_days, out),
            key.passphrase.as_ref(),
        )?;
        Ok(CertHandle {
            path: out.to_path_buf(),
        })
    }

    fn generate_csr(
        &self,
        key: &KeyHandle,
        config: ConfigRef<'_>,
        out: &Path,
    ) -> EngineResult<CsrHandle> {
        self.run(
            EngineStage::GenerateCsr,
            csr_args(key, config.path, out),
            key.passphrase.as_ref(),
        )?;
        Ok(CsrHandle {
            path: out.to_path_buf(),
        })
    }

    fn sign_csr(
        &self,
        csr: &CsrHandle,
        issuer_cert: &CertHandle,
        issuer_key: &KeyHandle,
        extensions: ExtensionsRef<'_>,
        validity_days: u32,
        out: &Path,
    ) -> EngineResult<CertHandle> {
        self.run(
            EngineStage::SignCsr,
            sign_args(csr, issuer_cert, issuer_key, &extensions, validity_days, out),
            issuer_key.passphrase.as_ref(),
        )?;
        Ok(CertHandle {
            path: out.to_path_buf(),
        })
    }
}
