// strain - one-shot CaseStrainer CLI
// Runs the citation pipeline over a file, pasted text, or URL and prints
// JSON results. Exit codes: 0 success, 2 bad input, 3 job failed, 4
// unreachable dependency.

use casestrainer::domain::{InputDescriptor, ResultMetadata, VerificationStatus};
use casestrainer::providers::courtlistener::CourtListenerProvider;
use casestrainer::providers::rate_limiter::RateLimiter;
use casestrainer::providers::{CitationDatabase, RateLimitConfig, RetryConfig};
use casestrainer::services::cache::{CitationCache, MemoryStore};
use casestrainer::services::loader::{DocumentLoader, LoaderError, StandardLoader};
use casestrainer::services::pipeline::CitationPipeline;
use casestrainer::services::verifier::Verifier;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const EXIT_BAD_INPUT: i32 = 2;
const EXIT_JOB_FAILED: i32 = 3;
const EXIT_UNREACHABLE: i32 = 4;

#[derive(Parser, Debug)]
#[command(
    name = "strain",
    about = "Extract, cluster, and verify legal citations from a document"
)]
struct Args {
    /// Path to a plain-text document
    #[arg(short, long, conflicts_with_all = ["text", "url"])]
    file: Option<String>,

    /// Text to analyze, passed directly
    #[arg(short, long, conflicts_with = "url")]
    text: Option<String>,

    /// URL to fetch and analyze
    #[arg(short, long)]
    url: Option<String>,

    /// Verify clusters against the citation database (needs DATABASE_API_KEY)
    #[arg(long)]
    verify: bool,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "casestrainer=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let descriptor = match build_descriptor(&args) {
        Ok(descriptor) => descriptor,
        Err(message) => {
            eprintln!("error: {}", message);
            return EXIT_BAD_INPUT;
        }
    };

    let loader = StandardLoader::new(Duration::from_secs(30));
    let text = match loader.load(&descriptor).await {
        Ok(text) => text,
        Err(e @ LoaderError::FetchFailed(_)) => {
            eprintln!("error: {}", e);
            return EXIT_UNREACHABLE;
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return EXIT_BAD_INPUT;
        }
    };

    let pipeline = CitationPipeline::new();
    let mut output = pipeline.run(&text);

    if args.verify {
        let Ok(api_key) = std::env::var("DATABASE_API_KEY") else {
            eprintln!("error: --verify requires DATABASE_API_KEY");
            return EXIT_BAD_INPUT;
        };

        let database: Arc<dyn CitationDatabase> = match CourtListenerProvider::new(
            api_key,
            Duration::from_secs(30),
            RetryConfig::default(),
        ) {
            Ok(provider) => Arc::new(provider),
            Err(e) => {
                eprintln!("error: {}", e);
                return EXIT_BAD_INPUT;
            }
        };

        let cache = Arc::new(CitationCache::new(Arc::new(MemoryStore::new())));
        let rate_limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
        let verifier = Verifier::new(database, cache, rate_limiter);

        let cancel = CancellationToken::new();
        for cluster in output.clusters.iter_mut() {
            verifier.verify_cluster(cluster, &cancel).await;
        }

        // A network-dead database fails every cluster the same way; report
        // that as an unreachable dependency rather than a result.
        let failures = output
            .clusters
            .iter()
            .filter(|c| c.verification_status == VerificationStatus::Failed)
            .count();
        if !output.clusters.is_empty() && failures == output.clusters.len() {
            eprintln!("error: citation database unreachable");
            return EXIT_UNREACHABLE;
        }
        if failures > 0 {
            print_result(&args, &output);
            return EXIT_JOB_FAILED;
        }
    }

    print_result(&args, &output);
    0
}

fn build_descriptor(args: &Args) -> Result<InputDescriptor, String> {
    if let Some(path) = &args.file {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path, e))?;
        return Ok(InputDescriptor::File {
            name: path.clone(),
            text,
        });
    }
    if let Some(text) = &args.text {
        return Ok(InputDescriptor::Text { text: text.clone() });
    }
    if let Some(url) = &args.url {
        return Ok(InputDescriptor::Url { url: url.clone() });
    }
    Err("one of --file, --text, or --url is required".to_string())
}

fn print_result(args: &Args, output: &casestrainer::services::pipeline::PipelineOutput) {
    let mut metadata = ResultMetadata {
        total: output.occurrences.len(),
        total_clusters: output.clusters.len(),
        statutes_excluded: output.statutes_excluded,
        warnings: output.warnings.clone(),
        ..ResultMetadata::default()
    };
    for cluster in &output.clusters {
        match cluster.verification_status {
            VerificationStatus::Verified => metadata.verified += 1,
            VerificationStatus::VerifiedByParallel => metadata.verified_by_parallel += 1,
            VerificationStatus::Unverified => metadata.unverified += 1,
            VerificationStatus::Failed => metadata.failed += 1,
        }
    }

    let body = serde_json::json!({
        "clusters": output.clusters,
        "citations": output.occurrences,
        "metadata": metadata,
    });

    let rendered = if args.pretty {
        serde_json::to_string_pretty(&body)
    } else {
        serde_json::to_string(&body)
    };
    match rendered {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("error: failed to render output: {}", e),
    }
}
