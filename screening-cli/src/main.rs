mod prompt;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use screening_flow::{
    Collaborators, Context, CredentialHolder, FileCredentialStore, HttpBackend, ImageUpload,
    InMemoryQuestionnaireStore, MAX_SELECTION, PostgresQuestionnaireStore, QuestionnaireStore,
    ScreeningConfig, WorkflowController, WorkflowState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dermascreen")]
#[command(about = "Guided skin-lesion self-screening")]
struct Cli {
    /// Backend base URL
    #[arg(long, env = "SCREENING_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account
    Register {
        /// National ID
        #[arg(long)]
        national_id: String,
        #[arg(long, env = "DERMASCREEN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Log in and keep the credential for later commands
    Login {
        /// National ID
        #[arg(long)]
        national_id: String,
        #[arg(long, env = "DERMASCREEN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Forget the stored credential
    Logout,
    /// Show who is logged in
    Status,
    /// Run a full screening for one lesion photo
    Screen {
        /// Path to the lesion image (JPEG or PNG)
        #[arg(long)]
        image: PathBuf,
    },
}

fn credential_store(config: &ScreeningConfig) -> Arc<FileCredentialStore> {
    Arc::new(FileCredentialStore::new(&config.credential_path))
}

/// Controller for commands that never touch the questionnaire.
fn account_controller(config: &ScreeningConfig) -> anyhow::Result<WorkflowController> {
    let backend = Arc::new(HttpBackend::new(&config.api_url, config.request_timeout)?);
    Ok(WorkflowController::new(
        Context::new(credential_store(config)),
        Collaborators::with_backend(
            backend,
            Arc::new(InMemoryQuestionnaireStore::with_abcde_questions()),
        ),
    ))
}

async fn screening_controller(config: &ScreeningConfig) -> anyhow::Result<WorkflowController> {
    let backend = Arc::new(HttpBackend::new(&config.api_url, config.request_timeout)?);

    let questionnaire: Arc<dyn QuestionnaireStore> = match &config.database_url {
        Some(url) => Arc::new(
            PostgresQuestionnaireStore::connect(
                url,
                &config.question_table,
                &config.questionnaire_table,
            )
            .await?,
        ),
        None => {
            warn!("DATABASE_URL not set, using the built-in ABCDE questionnaire");
            Arc::new(InMemoryQuestionnaireStore::with_abcde_questions())
        }
    };

    Ok(WorkflowController::new(
        Context::new(credential_store(config)),
        Collaborators::with_backend(backend, questionnaire),
    ))
}

/// Erases the persisted credential. Touches nothing but the credential file.
async fn logout(config: &ScreeningConfig) -> anyhow::Result<()> {
    CredentialHolder::new(credential_store(config))
        .clear()
        .await?;
    Ok(())
}

/// Subject of the persisted credential, if a complete one is present.
async fn logged_in_subject(config: &ScreeningConfig) -> anyhow::Result<Option<String>> {
    let holder = CredentialHolder::new(credential_store(config));
    Ok(holder
        .restore()
        .await?
        .map(|credential| credential.subject_id().to_string()))
}

/// Runs `step` until it succeeds. Retryable failures are reported and `ask`
/// decides whether to send the same step again.
async fn with_retry<T, F, Fut, A>(what: &str, mut step: F, mut ask: A) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = screening_flow::Result<T>>,
    A: FnMut() -> anyhow::Result<bool>,
{
    loop {
        match step().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                println!("{what} failed: {e}");
                if !ask()? {
                    return Err(e.into());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn ask_retry() -> anyhow::Result<bool> {
    loop {
        let Some(input) = prompt::line("Try again? [y/n] ")? else {
            return Ok(false);
        };
        match prompt::parse_yes_no(&input) {
            Some(answer) => return Ok(answer),
            None => println!("Please answer y or n."),
        }
    }
}

fn password_or_prompt(password: Option<String>) -> anyhow::Result<String> {
    match password {
        Some(password) => Ok(password),
        None => prompt::line("Password: ")?.context("no password given"),
    }
}

async fn require_session(controller: &WorkflowController) -> anyhow::Result<()> {
    if controller.resume().await? == WorkflowState::LoggedOut {
        bail!("Not logged in. Run `dermascreen login` first.");
    }
    Ok(())
}

async fn screen(controller: &WorkflowController, image_path: &Path) -> anyhow::Result<()> {
    require_session(controller).await?;

    let bytes = tokio::fs::read(image_path)
        .await
        .with_context(|| format!("failed to read {}", image_path.display()))?;
    let file_name = image_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    println!("Risk questionnaire (answer y/n)");
    for question in controller.load_questionnaire().await? {
        let answer = loop {
            let input = prompt::line(&format!("  {} ", question.prompt))?
                .context("questionnaire aborted")?;
            match prompt::parse_yes_no(&input) {
                Some(answer) => break answer,
                None => println!("  Please answer y or n."),
            }
        };
        controller.answer(&question.key, answer)?;
    }
    let record = controller.submit_questionnaire().await?;
    println!("Questionnaire saved ({})", record.id);

    println!("Analyzing {} ...", file_name);
    let upload = ImageUpload::from_file_name(file_name, bytes);
    let result = with_retry("Analysis", || controller.analyze(upload.clone()), ask_retry).await?;
    println!("Model probability: {:.3}", result.probability);

    if controller.state() == WorkflowState::Done {
        println!("No similar reference cases were returned.");
        return Ok(());
    }

    println!("Similar reference cases:");
    for (n, case) in result.similar_cases.iter().enumerate() {
        let mut details = vec![case.diagnosis.clone()];
        if let Some(age) = case.age {
            details.push(format!("age {age:.0}"));
        }
        details.extend(case.sex.clone());
        details.extend(case.localization.clone());
        println!("  {:>2}. {}  [{}]  {}", n + 1, case.case_id, details.join(", "), case.image_url);
    }

    let case_ids = result.case_ids();
    loop {
        let input = prompt::line(&format!(
            "Pick up to {MAX_SELECTION} cases most similar to yours (numbers or ids): "
        ))?
        .context("selection aborted")?;
        let picks = match prompt::parse_picks(&input, &case_ids) {
            Ok(picks) if !picks.is_empty() => picks,
            Ok(_) => {
                println!("Select at least one case.");
                continue;
            }
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        for id in controller.selection().ids().to_vec() {
            controller.toggle_case(&id)?;
        }
        for id in &picks {
            controller.toggle_case(id)?;
        }
        if picks.len() > MAX_SELECTION {
            println!("Only the first {MAX_SELECTION} picks were kept.");
        }
        break;
    }

    match with_retry(
        "Submitting the selection",
        || controller.submit_selection(),
        ask_retry,
    )
    .await?
    {
        Some(recommendation) => {
            println!();
            println!("Recommendation: {}", recommendation.text());
            controller.dismiss_recommendation()?;
        }
        None => println!("Selection saved. No recommendation was returned."),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ScreeningConfig::from_env()?;
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }
    match cli.command {
        Commands::Register {
            national_id,
            password,
        } => {
            let password = password_or_prompt(password)?;
            let message = account_controller(&config)?
                .register(&national_id, &password)
                .await?;
            println!("{message}");
        }
        Commands::Login {
            national_id,
            password,
        } => {
            let password = password_or_prompt(password)?;
            account_controller(&config)?
                .sign_in(&national_id, &password)
                .await?;
            println!("Logged in as {national_id}");
        }
        Commands::Logout => {
            logout(&config).await?;
            println!("Logged out");
        }
        Commands::Status => match logged_in_subject(&config).await? {
            Some(subject) => println!("Logged in as {subject}"),
            None => println!("Not logged in"),
        },
        Commands::Screen { image } => {
            // Checked before connecting so a logged-out user gets the login hint.
            if logged_in_subject(&config).await?.is_none() {
                bail!("Not logged in. Run `dermascreen login` first.");
            }
            screen(&screening_controller(&config).await?, &image).await?;
        }
    }

    Ok(())
}
