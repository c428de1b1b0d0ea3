//! Attention building blocks and the injected processor.
//!
//! `CrossAttention` is the backbone-side module; `IpAttnProcessor` replaces
//! its computation at one cross-attention site, adding a second attention
//! pass over the image tokens appended to the context sequence. Processors
//! reach the orchestrator's scale/active state through a weak handle, so the
//! backbone never owns a cycle back into the adapter.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, Weak};

use candle::{DType, Result, Tensor};
use candle_nn as nn;
use candle_nn::Module;

/// Shared conditioning state, owned by the orchestrator and read by every
/// processor on each forward pass. Single writer; the locks only make the
/// shared reads sound.
#[derive(Debug)]
pub struct AdapterControl {
    scale: RwLock<f64>,
    active: AtomicBool,
}

impl AdapterControl {
    pub fn new() -> Self {
        Self {
            scale: RwLock::new(1.0),
            active: AtomicBool::new(true),
        }
    }

    pub fn scale(&self) -> f64 {
        *self.scale.read().unwrap()
    }

    pub fn set_scale(&self, scale: f64) {
        *self.scale.write().unwrap() = scale
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed)
    }
}

impl Default for AdapterControl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct CrossAttention {
    to_q: nn::Linear,
    to_k: nn::Linear,
    to_v: nn::Linear,
    to_out: nn::Linear,
    heads: usize,
    scale: f64,
    span: tracing::Span,
    span_attn: tracing::Span,
    span_softmax: tracing::Span,
}

impl CrossAttention {
    pub fn new(
        vs: nn::VarBuilder,
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
    ) -> Result<Self> {
        let inner_dim = dim_head * heads;
        let context_dim = context_dim.unwrap_or(query_dim);
        let scale = 1.0 / f64::sqrt(dim_head as f64);
        let to_q = nn::linear_no_bias(query_dim, inner_dim, vs.pp("to_q"))?;
        let to_k = nn::linear_no_bias(context_dim, inner_dim, vs.pp("to_k"))?;
        let to_v = nn::linear_no_bias(context_dim, inner_dim, vs.pp("to_v"))?;
        let to_out = nn::linear(inner_dim, query_dim, vs.pp("to_out.0"))?;
        let span = tracing::span!(tracing::Level::TRACE, "xa");
        let span_attn = tracing::span!(tracing::Level::TRACE, "xa-attn");
        let span_softmax = tracing::span!(tracing::Level::TRACE, "xa-softmax");
        Ok(Self {
            to_q,
            to_k,
            to_v,
            to_out,
            heads,
            scale,
            span,
            span_attn,
            span_softmax,
        })
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    /// Clones of the text key/value projection weights, used to warm-start
    /// the image projections at the same site.
    pub fn kv_weights(&self) -> (Tensor, Tensor) {
        (self.to_k.weight().clone(), self.to_v.weight().clone())
    }

    fn reshape_heads_to_batch_dim(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, dim) = xs.dims3()?;
        xs.reshape((batch_size, seq_len, self.heads, dim / self.heads))?
            .transpose(1, 2)?
            .reshape((batch_size * self.heads, seq_len, dim / self.heads))
    }

    fn reshape_batch_dim_to_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, dim) = xs.dims3()?;
        xs.reshape((batch_size / self.heads, self.heads, seq_len, dim))?
            .transpose(1, 2)?
            .reshape((batch_size / self.heads, seq_len, dim * self.heads))
    }

    fn attention(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<Tensor> {
        let _enter = self.span_attn.enter();
        let in_dtype = query.dtype();
        let res = (|| -> Result<Tensor> {
            let query = query.to_dtype(DType::F32)?;
            let key = key.to_dtype(DType::F32)?;
            let value = value.to_dtype(DType::F32)?;
            let xs = query.matmul(&(key.t()? * self.scale)?)?;
            let xs = {
                let _enter = self.span_softmax.enter();
                nn::ops::softmax_last_dim(&xs)?
            };
            xs.matmul(&value)?.to_dtype(in_dtype)
        })();
        let xs = match res {
            Ok(xs) => xs,
            Err(err) => {
                tracing::error!("scaled-dot-product attention failed: {err}");
                return Err(err);
            }
        };
        self.reshape_batch_dim_to_heads(&xs)
    }

    /// The unmodified attention computation.
    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let query = self.to_q.forward(xs)?;
        let context = context.unwrap_or(xs).contiguous()?;
        let key = self.to_k.forward(&context)?;
        let value = self.to_v.forward(&context)?;
        let query = self.reshape_heads_to_batch_dim(&query)?;
        let key = self.reshape_heads_to_batch_dim(&key)?;
        let value = self.reshape_heads_to_batch_dim(&value)?;
        let xs = self.attention(&query, &key, &value)?;
        self.to_out.forward(&xs)
    }
}

/// Per-site injected processor. Inactive, it reproduces the plain attention
/// computation exactly; active, the trailing `num_tokens` entries of the
/// context are routed through dedicated key/value projections and blended in
/// under the runtime scale.
#[derive(Debug)]
pub struct IpAttnProcessor {
    to_k_ip: nn::Linear,
    to_v_ip: nn::Linear,
    num_tokens: usize,
    control: Weak<AdapterControl>,
    span: tracing::Span,
}

impl IpAttnProcessor {
    pub fn new(
        vs: nn::VarBuilder,
        hidden_size: usize,
        cross_attention_dim: usize,
        num_tokens: usize,
        control: Weak<AdapterControl>,
    ) -> Result<Self> {
        let to_k_ip = nn::linear_no_bias(cross_attention_dim, hidden_size, vs.pp("to_k_ip"))?;
        let to_v_ip = nn::linear_no_bias(cross_attention_dim, hidden_size, vs.pp("to_v_ip"))?;
        let span = tracing::span!(tracing::Level::TRACE, "ip-xa");
        Ok(Self {
            to_k_ip,
            to_v_ip,
            num_tokens,
            control,
            span,
        })
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Callers append exactly `num_tokens` image tokens to the end of the
    /// context sequence whenever the adapter is active; the split below
    /// relies on it.
    pub fn forward(
        &self,
        attn: &CrossAttention,
        xs: &Tensor,
        context: Option<&Tensor>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let control = self.control.upgrade();
        let is_active = control.as_ref().map(|c| c.is_active()).unwrap_or(false);
        let (context, ip_context) = match context {
            None => (None, None),
            Some(context) if is_active => {
                let seq_len = context.dim(1)?;
                if seq_len <= self.num_tokens {
                    candle::bail!(
                        "context of length {seq_len} cannot hold {} image tokens",
                        self.num_tokens
                    )
                }
                let end_pos = seq_len - self.num_tokens;
                (
                    Some(context.narrow(1, 0, end_pos)?),
                    Some(context.narrow(1, end_pos, self.num_tokens)?),
                )
            }
            Some(context) => (Some(context.clone()), None),
        };
        let query = attn.to_q.forward(xs)?;
        let context = match &context {
            Some(context) => context.contiguous()?,
            None => xs.contiguous()?,
        };
        let key = attn.to_k.forward(&context)?;
        let value = attn.to_v.forward(&context)?;
        let query = attn.reshape_heads_to_batch_dim(&query)?;
        let key = attn.reshape_heads_to_batch_dim(&key)?;
        let value = attn.reshape_heads_to_batch_dim(&value)?;
        let mut hidden = attn.attention(&query, &key, &value)?;
        if let (Some(ip_context), Some(control)) = (ip_context, control) {
            let ip_context = ip_context.contiguous()?;
            let ip_key = attn.reshape_heads_to_batch_dim(&self.to_k_ip.forward(&ip_context)?)?;
            let ip_value = attn.reshape_heads_to_batch_dim(&self.to_v_ip.forward(&ip_context)?)?;
            let ip_hidden = attn.attention(&query, &ip_key, &ip_value)?;
            hidden = (hidden + (ip_hidden * control.scale())?)?;
        }
        attn.to_out.forward(&hidden)
    }
}
