use std::time::Duration;

use courier::{
    MessageReceiver, MessageSender, ReceiverOptions, Telemetry, channel::InMemoryBroker,
};
use opentelemetry::{Context, KeyValue, baggage::BaggageExt, trace::TraceContextExt};
use opentelemetry_sdk::trace::SdkTracerProvider;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const QUEUE: &str = "weather-forecast";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WeatherForecast {
    location: String,
    date: String,
    temperature_c: i32,
    summary: String,
}

impl WeatherForecast {
    fn new(day: u32, temperature_c: i32) -> Self {
        Self {
            location: "NYC".to_string(),
            date: format!("2024-01-{day:02}"),
            temperature_c,
            summary: if temperature_c > 15 { "Mild" } else { "Chilly" }.to_string(),
        }
    }
}

async fn report(forecast: WeatherForecast, cx: Context) -> Result<(), tower::BoxError> {
    let station = cx
        .baggage()
        .get("station")
        .map(|value| value.to_string())
        .unwrap_or_default();

    tracing::info!(
        trace_id = %cx.span().span_context().trace_id(),
        %station,
        ?forecast,
        "Forecast received"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let provider = SdkTracerProvider::builder().build();
    let telemetry = Telemetry::from_provider(&provider);

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let broker = InMemoryBroker::new();

    let receiver = MessageReceiver::new(broker.channel())
        .with_telemetry(telemetry.clone())
        .with_options(ReceiverOptions::default().with_record_payload(true))
        .with_shutdown(cancel.clone());
    let subscription = receiver
        .receive(QUEUE, report)
        .await
        .expect("failed to subscribe");

    let sender = MessageSender::new(broker.channel()).with_telemetry(telemetry);
    let cx = Context::new().with_baggage([KeyValue::new("station", "central-park")]);

    for day in 1..=31 {
        if cancel.is_cancelled() {
            break;
        }
        let forecast = WeatherForecast::new(day, 5 + (day as i32 * 7) % 20);
        sender
            .send_with_context(&cx, QUEUE, &forecast)
            .await
            .expect("failed to send forecast");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    subscription.shutdown().await;
    provider.shutdown().expect("failed to flush spans");
}
