//! Recurrent cells and the two-stage regressor built on top of them

use candle_core::{Module, Tensor};
use candle_nn::rnn::Direction;
use candle_nn::{Dropout, GRUConfig, LSTMConfig, Linear, VarBuilder, RNN};

use super::ModelConfig;

/// Width of the hidden feed-forward layer in the output head
pub const HEAD_WIDTH: usize = 32;

/// One recurrent layer over a whole sequence
pub trait RecurrentCell: Sized + Send + Sync {
    fn build(
        in_dim: usize,
        hidden: usize,
        layer_idx: usize,
        direction: Direction,
        vb: VarBuilder,
    ) -> candle_core::Result<Self>;

    /// (batch, time, in_dim) -> (batch, time, hidden)
    fn sequence(&self, xs: &Tensor) -> candle_core::Result<Tensor>;
}

/// Gated cell with a separate cell-state channel
pub struct LstmCell(candle_nn::LSTM);

impl RecurrentCell for LstmCell {
    fn build(
        in_dim: usize,
        hidden: usize,
        layer_idx: usize,
        direction: Direction,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let config = LSTMConfig {
            layer_idx,
            direction,
            ..Default::default()
        };
        Ok(Self(candle_nn::lstm(in_dim, hidden, config, vb)?))
    }

    fn sequence(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let states = self.0.seq(xs)?;
        self.0.states_to_tensor(&states)
    }
}

/// Gated cell without a cell state
pub struct GruCell(candle_nn::GRU);

impl RecurrentCell for GruCell {
    fn build(
        in_dim: usize,
        hidden: usize,
        layer_idx: usize,
        direction: Direction,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        // gru() always names its tensors *_l0, so each layer gets its own prefix
        let suffix = match direction {
            Direction::Forward => "",
            Direction::Backward => "_reverse",
        };
        let vb = vb.pp(format!("l{layer_idx}{suffix}"));
        Ok(Self(candle_nn::gru(in_dim, hidden, GRUConfig::default(), vb)?))
    }

    fn sequence(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // states_to_tensor concatenates to (batch, time * hidden); stack instead
        let states: Vec<Tensor> = self.0.seq(xs)?.iter().map(|s| s.h().clone()).collect();
        Tensor::stack(&states, 1)
    }
}

/// Reverse a (batch, time, features) tensor along time
fn reverse_time(xs: &Tensor) -> candle_core::Result<Tensor> {
    let steps = xs.dim(1)?;
    let order: Vec<u32> = (0..steps as u32).rev().collect();
    let index = Tensor::new(order.as_slice(), xs.device())?;
    xs.index_select(&index, 1)
}

/// A layer run forwards, and backwards too when bidirectional
struct RecurrentLayer<C> {
    forward: C,
    backward: Option<C>,
}

impl<C: RecurrentCell> RecurrentLayer<C> {
    fn new(in_dim: usize, hidden: usize, idx: usize, bidirectional: bool, vb: &VarBuilder) -> candle_core::Result<Self> {
        let forward = C::build(in_dim, hidden, idx, Direction::Forward, vb.clone())?;
        let backward = if bidirectional {
            Some(C::build(in_dim, hidden, idx, Direction::Backward, vb.clone())?)
        } else {
            None
        };
        Ok(Self { forward, backward })
    }

    fn run(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let out = self.forward.sequence(xs)?;
        match &self.backward {
            None => Ok(out),
            Some(backward) => {
                let reversed = backward.sequence(&reverse_time(xs)?)?;
                Tensor::cat(&[&out, &reverse_time(&reversed)?], 2)
            }
        }
    }
}

/// Stacked recurrent stage, a narrower recurrent stage and a two-layer head
pub struct StackedRegressor<C> {
    stage1: Vec<RecurrentLayer<C>>,
    stage2: C,
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
}

impl<C: RecurrentCell> StackedRegressor<C> {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let directions = if config.bidirectional { 2 } else { 1 };
        let stage1_vb = vb.pp("rnn1");
        let mut stage1 = Vec::with_capacity(config.num_layers);
        for idx in 0..config.num_layers {
            let in_dim = if idx == 0 {
                config.input_size
            } else {
                config.hidden_size * directions
            };
            stage1.push(RecurrentLayer::new(
                in_dim,
                config.hidden_size,
                idx,
                config.bidirectional,
                &stage1_vb,
            )?);
        }

        let narrow = config.hidden_size / 2;
        let stage2 = C::build(
            config.hidden_size * directions,
            narrow,
            0,
            Direction::Forward,
            vb.pp("rnn2"),
        )?;
        let fc1 = candle_nn::linear(narrow, HEAD_WIDTH, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(HEAD_WIDTH, config.output_size, vb.pp("fc2"))?;

        Ok(Self {
            stage1,
            stage2,
            fc1,
            fc2,
            dropout: Dropout::new(config.dropout),
        })
    }

    /// (batch, time, input_size) -> (batch, output_size)
    pub fn forward(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut hidden = xs.clone();
        let last_layer = self.stage1.len().saturating_sub(1);
        for (idx, layer) in self.stage1.iter().enumerate() {
            hidden = layer.run(&hidden)?;
            // inter-layer dropout inside the stack
            if idx < last_layer {
                hidden = self.dropout.forward(&hidden, train)?;
            }
        }
        hidden = self.dropout.forward(&hidden, train)?;

        let sequence = self.stage2.sequence(&hidden)?;
        let steps = sequence.dim(1)?;
        let last = sequence.narrow(1, steps - 1, 1)?.squeeze(1)?;

        let out = self.dropout.forward(&last, train)?;
        let out = self.fc1.forward(&out)?.relu()?;
        let out = self.dropout.forward(&out, train)?;
        self.fc2.forward(&out)
    }
}
