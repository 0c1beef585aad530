use clap::{crate_description, crate_version, Parser};
use const_format::concatcp;
use futures::FutureExt;
use stackable_certificate_operator::{
    context::StaticControllerContext, controller, crd::Certificate, manager::CertificateManager,
    material::DEFAULT_CERT_LIFETIME, store::KubeStore, watch,
};
use stackable_operator::{
    logging::TracingTarget, namespace::WatchNamespace, time::Duration, CustomResourceExt,
};
use tokio::signal::unix::{signal, SignalKind};

pub const APP_NAME: &str = "certificate";
const OPERATOR_NAME: &str = "certificates.stackable.tech";
const CONTROLLER_NAME: &str = "certificate-manager";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

const COMMAND_BUFFER: usize = 32;

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<CertificateOperatorRun>,
}

#[derive(clap::Parser)]
struct CertificateOperatorRun {
    /// Only watch Certificates and Secrets in this namespace, or all namespaces if empty
    #[arg(long, env, default_value = "")]
    watch_namespace: WatchNamespace,

    /// Only manage Certificates in these namespaces, or all watched namespaces if unset
    #[arg(long = "controlled-namespace", env = "CONTROLLED_NAMESPACES", value_delimiter = ',')]
    controlled_namespaces: Vec<String>,

    /// Label to add to every managed object, as KEY=VALUE
    #[arg(long = "label", value_parser = parse_key_value)]
    labels: Vec<(String, String)>,

    /// Annotation to add to every managed object, as KEY=VALUE
    #[arg(long = "annotation", value_parser = parse_key_value)]
    annotations: Vec<(String, String)>,

    /// How long generated certificates are valid for
    #[arg(long, env, default_value_t = DEFAULT_CERT_LIFETIME)]
    certificate_lifetime: Duration,

    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

fn parse_key_value(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {arg:?}")),
    }
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        stackable_operator::cli::Command::Crd => {
            Certificate::print_yaml_schema()?;
        }
        stackable_operator::cli::Command::Run(CertificateOperatorRun {
            watch_namespace,
            controlled_namespaces,
            labels,
            annotations,
            certificate_lifetime,
            tracing_target,
        }) => {
            stackable_operator::logging::initialize_logging(
                "CERTIFICATE_OPERATOR_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            let client =
                stackable_operator::client::create_client(Some(FULL_CONTROLLER_NAME.to_string()))
                    .await?;
            let context = StaticControllerContext {
                namespaces: (!controlled_namespaces.is_empty())
                    .then(|| controlled_namespaces.into_iter().collect()),
                labels: labels.into_iter().collect(),
                annotations: annotations.into_iter().collect(),
            };
            let mut manager = CertificateManager::new(KubeStore::new(client.as_kube_client()))
                .with_context(context)
                .with_certificate_lifetime(certificate_lifetime);

            let (certificates, secrets) = watch::list_all(&client, &watch_namespace).await?;
            manager.recover(certificates, secrets).await;

            // Certificates are only declared by controllers that embed the manager
            let (_handle, commands) = controller::channel(COMMAND_BUFFER);
            let mut sigterm = signal(SignalKind::terminate())?;
            controller::run(
                manager,
                watch::events(&client, &watch_namespace),
                commands,
                sigterm.recv().map(|_| ()),
            )
            .await;
        }
    }
    Ok(())
}
