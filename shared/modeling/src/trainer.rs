use crate::{
    checkpoint::{rotate_checkpoints, save_checkpoint, save_model, LogEntry, TrainerState},
    Optimizer, Seq2SeqBatch, Seq2SeqLM,
};
use apteryx_core::{EvaluationStrategy, LearningRateSchedule, Shuffle, TrainingArguments};
use apteryx_data_provider::{Collator, DataLoader, Dataset};
use rand::seq::SliceRandom;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error(
        "output directory {0} already exists and is not empty; set overwrite_output_dir to reuse it"
    )]
    OutputDirNotEmpty(PathBuf),

    #[error("no model parameters require gradients")]
    NoTrainableParameters,

    #[error("training dataset is empty")]
    EmptyDataset,

    #[error("model returned no loss for a labelled batch")]
    NoLoss,

    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),

    #[error("failed to load batch: {0}")]
    Data(anyhow::Error),

    #[error("failed to save: {0}")]
    Save(anyhow::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    pub global_step: u32,
    /// Mean training loss over every optimizer step.
    pub training_loss: f64,
    /// The most recent evaluation, if one ran.
    pub eval_loss: Option<f64>,
}

fn is_non_empty_dir(path: &Path) -> io::Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Runs optimization of a [`Seq2SeqLM`] over a text dataset according to [`TrainingArguments`].
pub struct Trainer<'a, D, C>
where
    D: Dataset<Item = String> + 'static,
    C: Collator<String, Batch = Seq2SeqBatch> + 'static,
{
    model: &'a mut dyn Seq2SeqLM,
    args: TrainingArguments,
    collator: Arc<C>,
    train_dataset: Arc<D>,
    eval_dataset: Option<Arc<D>>,
    state: TrainerState,
}

impl<'a, D, C> Trainer<'a, D, C>
where
    D: Dataset<Item = String> + 'static,
    C: Collator<String, Batch = Seq2SeqBatch> + 'static,
{
    /// Checks the output directory and that something is trainable; nothing is computed yet.
    pub fn new(
        model: &'a mut dyn Seq2SeqLM,
        args: TrainingArguments,
        collator: Arc<C>,
        train_dataset: D,
        eval_dataset: Option<D>,
    ) -> Result<Self, TrainerError> {
        if !args.overwrite_output_dir && is_non_empty_dir(&args.output_dir)? {
            return Err(TrainerError::OutputDirNotEmpty(args.output_dir.clone()));
        }
        if model.trainable_parameters().is_empty() {
            return Err(TrainerError::NoTrainableParameters);
        }
        Ok(Self {
            model,
            args,
            collator,
            train_dataset: Arc::new(train_dataset),
            eval_dataset: eval_dataset.map(Arc::new),
            state: TrainerState::default(),
        })
    }

    pub fn args(&self) -> &TrainingArguments {
        &self.args
    }

    pub fn train_dataset(&self) -> &D {
        &self.train_dataset
    }

    pub fn eval_dataset(&self) -> Option<&D> {
        self.eval_dataset.as_deref()
    }

    fn batches_per_epoch(&self) -> usize {
        self.train_dataset
            .len()
            .div_ceil(self.args.per_device_train_batch_size)
    }

    /// Optimizer steps in the whole run, saturating at `u32::MAX`.
    pub fn total_steps(&self) -> u32 {
        match self.args.max_steps {
            Some(max_steps) => max_steps,
            None => {
                let steps_per_epoch = self
                    .batches_per_epoch()
                    .div_ceil(self.args.gradient_accumulation_steps);
                u32::try_from(steps_per_epoch)
                    .unwrap_or(u32::MAX)
                    .saturating_mul(self.args.num_train_epochs)
            }
        }
    }

    fn forward_backward(
        &self,
        batch: &Seq2SeqBatch,
        loss_scale: f64,
        autocast: bool,
    ) -> Result<f64, TrainerError> {
        let inputs = batch.to_tensors(self.model.device());
        let (_, loss) = tch::autocast(autocast, || self.model.forward(&inputs, true));
        let loss = loss.ok_or(TrainerError::NoLoss)?;
        (&loss / loss_scale).backward();
        Ok(loss.f_double_value(&[])?)
    }

    /// Mean loss over the eval dataset, or `None` without one.
    pub fn evaluate(&self) -> Result<Option<f64>, TrainerError> {
        let Some(eval_dataset) = &self.eval_dataset else {
            return Ok(None);
        };
        if eval_dataset.is_empty() {
            return Ok(None);
        }
        let _no_grad = tch::no_grad_guard();
        let loader = DataLoader::new(
            eval_dataset.clone(),
            self.collator.clone(),
            (0..eval_dataset.len()).collect(),
            self.args.per_device_eval_batch_size,
            self.args.dataloader_num_workers,
        )
        .map_err(TrainerError::Data)?;
        let (mut total, mut count) = (0.0, 0usize);
        for batch in loader {
            let batch = batch.map_err(TrainerError::Data)?;
            let inputs = batch.to_tensors(self.model.device());
            let (_, loss) = self.model.forward(&inputs, false);
            let loss = loss.ok_or(TrainerError::NoLoss)?;
            // weight by batch size so a short final batch doesn't skew the mean
            total += loss.f_double_value(&[])? * batch.len() as f64;
            count += batch.len();
        }
        Ok((count > 0).then(|| total / count as f64))
    }

    fn save(&self) -> Result<(), TrainerError> {
        save_checkpoint(&*self.model, &self.state, &self.args.output_dir)
            .map_err(TrainerError::Save)?;
        if let Some(limit) = self.args.save_total_limit {
            rotate_checkpoints(&self.args.output_dir, limit)?;
        }
        Ok(())
    }

    fn log_eval(&mut self, epoch: u32) -> Result<Option<f64>, TrainerError> {
        let eval_loss = self.evaluate()?;
        if let Some(eval_loss) = eval_loss {
            info!(step = self.state.global_step, epoch, eval_loss, "Evaluation");
            self.state.log_history.push(LogEntry {
                step: self.state.global_step,
                epoch,
                loss: None,
                learning_rate: None,
                eval_loss: Some(eval_loss),
            });
        }
        Ok(eval_loss)
    }

    /// Trains until `max_steps` optimizer steps, or `num_train_epochs` epochs when unset, then
    /// writes the final weights to `output_dir`.
    pub fn run(mut self) -> Result<TrainOutput, TrainerError> {
        if self.train_dataset.is_empty() {
            return Err(TrainerError::EmptyDataset);
        }
        let device = self.model.device();
        let autocast = match (self.args.fp16, device.is_cuda()) {
            (true, true) => true,
            (true, false) => {
                warn!("fp16 requested but training on CPU, falling back to fp32");
                false
            }
            (false, _) => false,
        };

        let parameters = self.model.trainable_parameters();
        let mut optimizer = Optimizer::adamw(parameters, &self.args)?;
        let total_steps = self.total_steps();
        let schedule: LearningRateSchedule = self.args.lr_schedule(total_steps);
        let accumulation = self.args.gradient_accumulation_steps;
        let eval_interval = self.args.eval_interval();
        let mut rng = Shuffle::from_u64(self.args.seed).rng();

        info!(
            examples = self.train_dataset.len(),
            parameters = optimizer.num_parameters(),
            total_steps,
            batch_size = self.args.per_device_train_batch_size,
            gradient_accumulation_steps = accumulation,
            device = ?device,
            "Starting training"
        );
        fs::create_dir_all(&self.args.output_dir)?;

        let start = Instant::now();
        let mut loss_sum = 0.0;
        let mut logged_loss_sum = 0.0;
        let mut logged_steps = 0u32;
        let mut eval_loss = None;
        let mut epoch = 0u32;

        'epochs: while self.state.global_step < total_steps {
            self.state.epoch = epoch;
            let mut order: Vec<usize> = (0..self.train_dataset.len()).collect();
            order.shuffle(&mut rng);
            let loader = DataLoader::new(
                self.train_dataset.clone(),
                self.collator.clone(),
                order,
                self.args.per_device_train_batch_size,
                self.args.dataloader_num_workers,
            )
            .map_err(TrainerError::Data)?;
            let num_batches = loader.num_batches();
            debug!(epoch, num_batches, "Epoch begin");

            let mut step_loss = 0.0;
            let mut micro_batches = 0;
            for (index, batch) in loader.enumerate() {
                let batch = batch.map_err(TrainerError::Data)?;
                // the last step of an epoch may have fewer micro batches
                let remaining = num_batches - (index - micro_batches);
                let micro_batches_this_step = accumulation.min(remaining);
                step_loss += self.forward_backward(
                    &batch,
                    micro_batches_this_step as f64,
                    autocast,
                )? / micro_batches_this_step as f64;
                micro_batches += 1;
                trace!(micro_batch = micro_batches, "Finished micro batch forward/backward");
                if micro_batches < micro_batches_this_step {
                    continue;
                }

                let lr = schedule.get_lr(self.state.global_step);
                let grad_norm = optimizer.step(lr)?;
                self.state.global_step += 1;
                let step = self.state.global_step;
                loss_sum += step_loss;
                logged_loss_sum += step_loss;
                logged_steps += 1;
                debug!(step, loss = step_loss, lr, grad_norm, "Optimizer step");

                if step % self.args.logging_steps == 0 {
                    let loss = logged_loss_sum / logged_steps as f64;
                    info!(
                        step,
                        epoch,
                        loss,
                        lr,
                        elapsed = start.elapsed().as_secs_f64(),
                        "Training"
                    );
                    self.state.log_history.push(LogEntry {
                        step,
                        epoch,
                        loss: Some(loss),
                        learning_rate: Some(lr),
                        eval_loss: None,
                    });
                    logged_loss_sum = 0.0;
                    logged_steps = 0;
                }
                if eval_interval.is_some_and(|interval| step % interval == 0) {
                    eval_loss = self.log_eval(epoch)?.or(eval_loss);
                }
                if step % self.args.save_steps == 0 {
                    self.save()?;
                }

                step_loss = 0.0;
                micro_batches = 0;
                if step >= total_steps {
                    break 'epochs;
                }
            }

            if self.args.evaluation_strategy == EvaluationStrategy::Epoch {
                eval_loss = self.log_eval(epoch)?.or(eval_loss);
            }
            epoch += 1;
        }

        save_model(&*self.model, &self.args.output_dir).map_err(TrainerError::Save)?;
        let global_step = self.state.global_step;
        let training_loss = match global_step {
            0 => 0.0,
            steps => loss_sum / steps as f64,
        };
        info!(
            global_step,
            training_loss,
            eval_loss,
            elapsed = start.elapsed().as_secs_f64(),
            output_dir = %self.args.output_dir.display(),
            "Training finished"
        );
        Ok(TrainOutput {
            global_step,
            training_loss,
            eval_loss,
        })
    }
}
