//! CLI command implementations

use clap::{Parser, Subcommand, ValueEnum};
use rand::{rngs::OsRng, RngCore};
use std::path::PathBuf;
use zeroize::Zeroizing;

use devlock_core::{AuthPurpose, AutomaticLocking, BiometricEvent, Challenge, EnvSignal, Signal};
use devlock_daemon::{DaemonConfig, SettingsUpdate};

use crate::client::{ClientError, DevlockClient};

/// devlock CLI - Device lock control
#[derive(Parser)]
#[command(name = "devlock")]
#[command(about = "Control the device lock daemon")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to daemon socket
    #[arg(long, default_value_os_t = DaemonConfig::default_ipc_path())]
    pub socket: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show daemon and lock status
    Status,

    /// Lock the device now
    Lock,

    /// Unlock the device
    Unlock {
        /// Lock code (prompted when omitted)
        #[arg(long)]
        code: Option<String>,
    },

    /// Authenticate and print the resulting token
    Authenticate {
        /// Challenge (hex encoded, random when omitted)
        #[arg(long)]
        challenge: Option<String>,

        /// Lock code (prompted when omitted)
        #[arg(long)]
        code: Option<String>,
    },

    /// Set or change the lock code
    ChangeCode {
        /// Current lock code, if one is set
        #[arg(long)]
        current: Option<String>,

        /// New lock code (prompted when omitted)
        #[arg(long)]
        new: Option<String>,
    },

    /// Remove the lock code and disable device locking
    ClearCode {
        /// Current lock code (prompted when omitted)
        #[arg(long)]
        current: Option<String>,
    },

    /// Change lock settings (requires the lock code)
    Settings {
        /// Automatic locking in minutes (-1 disables, 0 locks immediately)
        #[arg(long, allow_hyphen_values = true)]
        autolock: Option<i32>,

        /// Attempts before lockout (0 or less for unlimited)
        #[arg(long, allow_hyphen_values = true)]
        max_attempts: Option<i32>,

        /// Whether the code is entered with a full keyboard
        #[arg(long)]
        keyboard: Option<bool>,

        /// Whether a rejected fingerprint counts as a failed attempt
        #[arg(long)]
        mismatch_consumes_attempt: Option<bool>,

        /// Lock code (prompted when omitted)
        #[arg(long)]
        code: Option<String>,
    },

    /// Report an environment signal (daemon dev mode only)
    Env {
        /// Signal: display, call, input-lock or inactivity
        signal: EnvSignal,

        /// New value
        #[arg(action = clap::ArgAction::Set)]
        value: bool,
    },

    /// Report a biometric sensor event (daemon dev mode only)
    Biometric {
        #[arg(value_enum)]
        event: BiometricArg,
    },

    /// Print signals as they arrive
    Watch {
        /// Also register as an input observer for this purpose
        #[arg(long, value_enum)]
        input: Option<PurposeArg>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BiometricArg {
    Evaluating,
    Match,
    Mismatch,
}

impl From<BiometricArg> for BiometricEvent {
    fn from(arg: BiometricArg) -> Self {
        match arg {
            BiometricArg::Evaluating => BiometricEvent::Evaluating,
            BiometricArg::Match => BiometricEvent::Match,
            BiometricArg::Mismatch => BiometricEvent::Mismatch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PurposeArg {
    Unlock,
    Authentication,
}

impl From<PurposeArg> for AuthPurpose {
    fn from(arg: PurposeArg) -> Self {
        match arg {
            PurposeArg::Unlock => AuthPurpose::DeviceUnlock,
            PurposeArg::Authentication => AuthPurpose::Authentication,
        }
    }
}

/// Use the argument, or prompt for it without echo
fn code_or_prompt(code: Option<String>, prompt: &str) -> Result<Zeroizing<String>, ClientError> {
    match code {
        Some(code) => Ok(Zeroizing::new(code)),
        None => Ok(Zeroizing::new(rpassword::prompt_password(format!(
            "{}: ",
            prompt
        ))?)),
    }
}

fn random_challenge() -> Challenge {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    Challenge::new(bytes.to_vec())
}

fn parse_challenge(challenge: Option<String>) -> Result<Challenge, ClientError> {
    match challenge {
        Some(hex) => Challenge::from_hex(&hex).map_err(|e| ClientError::RequestFailed {
            kind: devlock_core::ErrorKind::InvalidArgument,
            message: format!("Invalid challenge: {}", e),
        }),
        None => Ok(random_challenge()),
    }
}

/// Run the CLI
pub async fn run(cli: Cli) -> Result<(), ClientError> {
    let client = DevlockClient::with_socket_path(cli.socket);

    match cli.command {
        Commands::Status => {
            let info = match client.ping().await {
                Ok(info) => info,
                Err(ClientError::DaemonNotRunning) => {
                    println!("devlock daemon is not running");
                    println!("Start it with: devlockd");
                    return Err(ClientError::DaemonNotRunning);
                }
                Err(e) => return Err(e),
            };
            let properties = client.properties().await?;

            println!(
                "devlock daemon v{} is running (protocol {})",
                info.version, info.protocol
            );
            println!("State: {}", properties.state);
            println!(
                "Device lock: {}",
                if properties.enabled { "enabled" } else { "disabled" }
            );
            println!("Automatic locking: {}", properties.automatic_locking);
            println!(
                "Lock code: {}",
                if properties.lock_code_set { "set" } else { "not set" }
            );
            println!(
                "Code length: {}-{}{}",
                properties.minimum_code_length,
                properties.maximum_code_length,
                if properties.code_input_is_keyboard {
                    " (keyboard)"
                } else {
                    " (digits)"
                }
            );
            match properties.maximum_attempts {
                Some(max) => println!("Maximum attempts: {}", max),
                None => println!("Maximum attempts: unlimited"),
            }
            println!("Available methods: {}", properties.available_methods);
            if properties.authenticating {
                println!(
                    "Authenticating with {}{}",
                    properties.utilized_methods,
                    if properties.unlocking { " (unlock)" } else { "" }
                );
            }
        }

        Commands::Lock => {
            client.lock().await?;
            println!("Device locked");
        }

        Commands::Unlock { code } => {
            let code = code_or_prompt(code, "Lock code")?;
            if client.unlock(&code).await? {
                println!("Device unlocked");
            } else {
                println!("Device is not locked");
            }
        }

        Commands::Authenticate { challenge, code } => {
            let challenge = parse_challenge(challenge)?;
            let code = code_or_prompt(code, "Lock code")?;
            let token = client.authenticate(challenge, &code).await?;
            println!("{}", token.as_str());
        }

        Commands::ChangeCode { current, new } => {
            let new = code_or_prompt(new, "New lock code")?;
            client
                .change_lock_code(current.as_deref(), &new)
                .await?;
            println!("Lock code changed");
        }

        Commands::ClearCode { current } => {
            let current = code_or_prompt(current, "Current lock code")?;
            client.clear_lock_code(&current).await?;
            println!("Lock code removed; device locking disabled");
        }

        Commands::Settings {
            autolock,
            max_attempts,
            keyboard,
            mismatch_consumes_attempt,
            code,
        } => {
            let update = SettingsUpdate {
                automatic_locking: autolock.map(AutomaticLocking::from),
                maximum_attempts: max_attempts,
                code_input_is_keyboard: keyboard,
                biometric_mismatch_consumes_attempt: mismatch_consumes_attempt,
            };
            if update.is_empty() {
                println!("Nothing to change");
                return Ok(());
            }

            let code = code_or_prompt(code, "Lock code")?;
            client
                .update_settings(random_challenge(), &code, update)
                .await?;
            println!("Settings updated");
        }

        Commands::Env { signal, value } => {
            client.report_environment(signal, value).await?;
            println!("Reported {}={}", signal, value);
        }

        Commands::Biometric { event } => {
            client.report_biometric(event.into()).await?;
            println!("Reported biometric {:?}", event);
        }

        Commands::Watch { input } => {
            let mut session = client.session().await?;
            if let Some(purpose) = input {
                session.register_input(purpose.into()).await?;
            }

            while let Some(signal) = session.next_signal().await? {
                print_signal(&signal)?;
            }
            println!("Daemon closed the connection");
        }
    }

    Ok(())
}

fn print_signal(signal: &Signal) -> Result<(), ClientError> {
    let json = serde_json::to_string(signal)?;
    println!("{} {}", chrono::Local::now().format("%H:%M:%S%.3f"), json);
    Ok(())
}
