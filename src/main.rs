use std::{collections::BTreeMap, sync::atomic::Ordering};

use clap::Parser;
use spcm_console::{
    args::{convert_filter, Args},
    sim::{self, GateTrainProvider, SimSignal},
    AcquisitionControl, Config, Result,
};
use tracing::{info, warn};

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let config = Config::from_file(&args.config)?;
    let sim_config = config.sim.clone().unwrap_or_default();
    let (tx_hw, rx_hw) = sim::instrument(SimSignal::from_config(&sim_config));
    let provider = GateTrainProvider::new(sim_config, &config.tx);

    let mut control = AcquisitionControl::new(config, Box::new(provider));
    for warning in control.connect(Box::new(tx_hw), Box::new(rx_hw))? {
        warn!("{warning}");
    }

    let interrupt = control.interrupt_handle();
    if let Err(e) = ctrlc::set_handler(move || interrupt.store(true, Ordering::Release)) {
        warn!(error = %e, "Could not install the interrupt handler");
    }

    let parameter = args.parameter();
    let summary = control.run(&args.sequence, &parameter, args.averages as usize)?;
    for avg in summary.averages.iter().filter(|a| a.timed_out) {
        warn!(
            average = avg.index,
            "Received {}/{} gates", avg.received, avg.expected
        );
    }

    let info = BTreeMap::from([
        ("sequence".to_owned(), args.sequence.display().to_string()),
        ("larmor_frequency".to_owned(), parameter.larmor_frequency.to_string()),
        ("downsampling_rate".to_owned(), parameter.downsampling_rate.to_string()),
        ("b1_scaling".to_owned(), parameter.b1_scaling.to_string()),
        ("fov_scaling".to_owned(), parameter.fov_scaling.to_string()),
        ("averages".to_owned(), args.averages.to_string()),
    ]);
    let path = control.result().write(&args.output, &info)?;
    info!(path = %path.display(), "Done");
    control.disconnect();
    Ok(())
}
