use burn::tensor::backend::AutodiffBackend;
use burn_distill::backend::{MainAutoBackend, MainDevice};
use burn_distill::cli::{AppArgs, Command, HELP};
use burn_distill::config::{TrainingConfig, training_config};
use burn_distill::model::load_teacher;
use burn_distill::training::train;
use burn_distill::Result;

pub fn launch<AutoB: AutodiffBackend + MainDevice>(app_args: &AppArgs) -> Result<()> {
    let config = match &app_args.training_config {
        Some(path) => TrainingConfig::load_file(path)?,
        None => training_config(),
    };

    let training_device = AutoB::main_device();
    let teacher = app_args
        .teacher
        .as_ref()
        .map(|path| load_teacher::<AutoB>(path, &config.model, &training_device))
        .transpose()?;

    let summary = train::<AutoB>(&config, &app_args.data_dir, teacher, training_device)?;
    if let Some(valid) = summary.valid.last() {
        println!(
            "final valid_loss {:.4}, val_acc {:.4}",
            valid.loss, valid.accuracy
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    match AppArgs::parse()? {
        Command::Help => println!("{HELP}"),
        Command::Train(app_args) => launch::<MainAutoBackend>(&app_args)?,
    }
    Ok(())
}
