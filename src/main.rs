use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use claimflow_rs::adk::config::Settings;
use claimflow_rs::adk::model::openai::OpenAICompatibleModel;
use claimflow_rs::adk::model::ping;
use claimflow_rs::adk::recognition::{HuggingFaceOcr, ImageSource, TextRecognizer};
use claimflow_rs::extraction::loader::CatalogLoader;
use claimflow_rs::extraction::{FieldCatalog, Step, WorkflowRunner, WorkflowState, CMS_1500};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Extra form catalogs (YAML) merged over the built-in ones
    #[arg(short, long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract fields from an OCR transcript on disk
    Extract {
        /// Path to the OCR text file
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short = 't', long, default_value = CMS_1500)]
        form_type: String,

        /// Pretty-print the resulting state
        #[arg(long)]
        pretty: bool,
    },
    /// Run OCR on a form image, then extract fields
    Process {
        /// http(s) or data: URL of a form page image; repeat for multi-page forms
        #[arg(short, long, required = true)]
        image_url: Vec<String>,

        #[arg(short = 't', long, default_value = CMS_1500)]
        form_type: String,

        #[arg(long)]
        pretty: bool,
    },
    /// List catalog form types, or the fields of one
    Catalog {
        #[arg(short = 't', long)]
        form_type: Option<String>,
    },
    /// Check that the OCR and reasoning providers answer
    Check {
        /// Form image sent to the OCR provider
        #[arg(short, long, default_value = SAMPLE_FORM_URL)]
        image_url: String,
    },
}

const SAMPLE_FORM_URL: &str = "https://www.texasattorneygeneral.gov/sites/default/files/files/divisions/crime-victims/CMS%201500%20Sample.pdf";

fn load_catalog(path: Option<&PathBuf>) -> anyhow::Result<FieldCatalog> {
    let mut catalog = FieldCatalog::builtin();
    if let Some(path) = path {
        CatalogLoader::new()
            .load_into(&mut catalog, path)
            .with_context(|| format!("loading catalog {}", path.display()))?;
    }
    Ok(catalog)
}

/// Token that fires on Ctrl-C
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, stopping after the current node");
            trigger.cancel();
        }
    });
    token
}

async fn extract(
    settings: &Settings,
    catalog: FieldCatalog,
    ocr_text: &str,
    form_type: &str,
) -> anyhow::Result<WorkflowState> {
    let model = OpenAICompatibleModel::from_settings(settings)?;
    log::info!("Using reasoning model: {}", settings.llm_model);

    let runner = WorkflowRunner::new(
        Arc::new(model),
        Arc::new(catalog),
        settings.workflow_options(),
    );
    let state = runner
        .run_with_cancel(ocr_text, form_type, interrupt_token())
        .await?;
    Ok(state)
}

async fn check_ocr(settings: &Settings, image_url: &str) -> anyhow::Result<()> {
    let image = ImageSource::parse(image_url)?;
    let ocr = HuggingFaceOcr::from_settings(settings)?;
    println!("Testing OCR ({}) on {}", settings.ocr_model, image_url);
    let text = ocr.recognize(&image).await?;
    println!("Extracted text length: {} characters", text.len());
    println!("First 500 characters:");
    println!("{}", text.chars().take(500).collect::<String>());
    Ok(())
}

async fn check_llm(settings: &Settings) -> anyhow::Result<()> {
    let model = OpenAICompatibleModel::from_settings(settings)?;
    println!("Testing reasoning model ({})", settings.llm_model);
    let reply = ping(&model).await?;
    println!("Response: {}", reply);
    Ok(())
}

/// Run both provider checks and report; returns whether both passed
async fn check(settings: &Settings, image_url: &str) -> bool {
    let mut ok = true;
    for (name, result) in [
        ("OCR", check_ocr(settings, image_url).await),
        ("LLM", check_llm(settings).await),
    ] {
        match result {
            Ok(()) => println!("  {}: working", name),
            Err(e) => {
                println!("  {}: failed ({:#})", name, e);
                ok = false;
            }
        }
    }
    if !ok {
        println!("Some connections failed, check the API keys in .env");
    }
    ok
}

fn print_state(state: &WorkflowState, pretty: bool) -> anyhow::Result<()> {
    let out = if pretty {
        serde_json::to_string_pretty(state)?
    } else {
        serde_json::to_string(state)?
    };
    println!("{}", out);
    Ok(())
}

fn exit_code(state: &WorkflowState) -> i32 {
    match state.current_step() {
        Step::Done => 0,
        Step::Failed => 2,
        // cancelled before a terminal step
        _ => 130,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let settings = Settings::from_env()?;
    let catalog = load_catalog(args.catalog.as_ref())?;

    let (state, pretty) = match args.command {
        Commands::Extract {
            file,
            form_type,
            pretty,
        } => {
            let ocr_text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            (extract(&settings, catalog, &ocr_text, &form_type).await?, pretty)
        }
        Commands::Process {
            image_url,
            form_type,
            pretty,
        } => {
            let images = image_url
                .iter()
                .map(|raw| ImageSource::parse(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let ocr = HuggingFaceOcr::from_settings(&settings)?;
            log::info!("Using OCR model: {} on {} page(s)", settings.ocr_model, images.len());
            let pages = ocr.recognize_batch(&images).await.context("OCR failed")?;
            let ocr_text = pages.join("\n\n");
            (extract(&settings, catalog, &ocr_text, &form_type).await?, pretty)
        }
        Commands::Catalog { form_type } => {
            match form_type {
                Some(form_type) => {
                    let form = catalog.form(&form_type)?;
                    println!("{}", serde_yaml::to_string(form)?);
                }
                None => {
                    for form_type in catalog.form_types() {
                        let form = catalog.form(form_type)?;
                        println!("{}\t{} fields\t{}", form_type, form.fields.len(), form.description);
                    }
                }
            }
            return Ok(());
        }
        Commands::Check { image_url } => {
            if !check(&settings, &image_url).await {
                std::process::exit(1);
            }
            return Ok(());
        }
    };

    print_state(&state, pretty)?;
    let code = exit_code(&state);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
