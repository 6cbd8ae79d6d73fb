use time::macros::format_description;
use tracing::{level_filters::LevelFilter, Level};
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub fn init_log(level: Level) -> eyre::Result<()> {
    let filter = tracing_subscriber::filter::Targets::new()
        .with_targets(vec![
            ("rtun", level),
            ("rtun_core", level),
            ("rtun_gateway", level),
            ("rtun_client", level),
            ("rtun_transport", level),
        ])
        .with_default(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer().with_target(true).with_timer(LocalTime::new(format_description!(
                "[year repr:last_two]-[month]-[day] [hour]:[minute]:[second]"
            ))),
        )
        .try_init()?;

    Ok(())
}
