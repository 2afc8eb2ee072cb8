// Reversible layers: reconstruction, fused gradients and memory-efficient
// Serial backprop, checked against the tape.

use proptest::prelude::*;
use strand_core::{DType, Result, RngKey, ShapeDtype, Tensor};
use strand_cpu::{CpuBackend, CpuDevice, CpuTensor};
use strand_nn::{
    naive_reverse_and_grad, qkv_heads, tape_backprop, AttentionType, BroadcastedDropout, Chunk,
    ComputeAttentionOutput, Dense, Dup, FusedAttention, Layer, LayerNorm, Map, Mode, Relu, ReversibleAttentionHalfResidual,
    ReversibleHalfResidual, ReversibleLayer, ReversibleSerial, ReversibleSwap, Serial, SplitForOutput, Tree, Unchunk,
};

type B = CpuBackend;

const D: usize = 4;

fn randn(key: RngKey, shape: (usize, usize, usize)) -> Result<CpuTensor> {
    key.normal(shape, 0.0, 1.0, DType::F64, &CpuDevice)
}

fn sig() -> ShapeDtype {
    ShapeDtype::new((2, 6, D), DType::F64)
}

fn assert_close(got: &[CpuTensor], expected: &[CpuTensor], tol: f64) -> Result<()> {
    assert_eq!(got.len(), expected.len(), "tensor count mismatch");
    for (g, e) in got.iter().zip(expected) {
        assert_eq!(g.dims(), e.dims());
        for (a, b) in g.to_f64_vec()?.iter().zip(e.to_f64_vec()?) {
            assert!((a - b).abs() < tol, "got {} expected {} (tol {})", a, b, tol);
        }
    }
    Ok(())
}

fn feed_forward() -> Vec<Box<dyn Layer<B>>> {
    vec![
        Box::new(LayerNorm::new()),
        Box::new(Dense::new(8)),
        Box::new(Relu),
        Box::new(Dense::new(D)),
    ]
}

fn attention_half(kernel: AttentionType, share_qk: bool) -> ReversibleAttentionHalfResidual<B> {
    let mut pre: Vec<Box<dyn Layer<B>>> = vec![Box::new(Chunk::new(2)), Box::new(LayerNorm::new())];
    pre.extend(qkv_heads(2, 3, 3, share_qk));
    let post: Vec<Box<dyn Layer<B>>> = vec![
        Box::new(ComputeAttentionOutput::new(2, D)),
        Box::new(Unchunk::new(2)),
        Box::new(BroadcastedDropout::new(0.2, Mode::Train)),
    ];
    ReversibleAttentionHalfResidual::new(pre, kernel.fused(Mode::Train), post)
}

fn blocks(n: usize) -> Vec<Box<dyn ReversibleLayer<B>>> {
    let mut layers: Vec<Box<dyn ReversibleLayer<B>>> = Vec::new();
    for i in 0..n {
        let kernel = if i % 2 == 0 {
            AttentionType::DotProductCausal
        } else {
            AttentionType::MemoryEfficientCausal
        };
        layers.push(Box::new(attention_half(kernel, i % 2 == 1)));
        layers.push(Box::new(ReversibleSwap));
        layers.push(Box::new(ReversibleHalfResidual::new(feed_forward())));
        layers.push(Box::new(ReversibleSwap));
    }
    layers
}

/// forward then reverse, returning (inputs, reconstructed).
fn round_trip<L: ReversibleLayer<B>>(layer: &L, seed: u64) -> Result<(Vec<CpuTensor>, Vec<CpuTensor>)> {
    let key = RngKey::new(seed);
    let init = layer.init(&[sig(), sig()], key.fold_in(0), &CpuDevice)?;
    let inputs = vec![randn(key.fold_in(1), (2, 6, D))?, randn(key.fold_in(2), (2, 6, D))?];
    let rng = Some(key.fold_in(3));
    let (outputs, _) = layer.forward(&inputs, &init.params, &init.state, rng)?;
    let back = layer.reverse(&outputs, &init.params, &init.state, rng)?;
    Ok((inputs, back))
}

/// Fused and naive reverse_and_grad on the same outputs and cotangents.
fn check_fused_matches_naive<L: ReversibleLayer<B>>(layer: &L, seed: u64) -> Result<()> {
    let key = RngKey::new(seed);
    let init = layer.init(&[sig(), sig()], key.fold_in(0), &CpuDevice)?;
    let inputs = vec![randn(key.fold_in(1), (2, 6, D))?, randn(key.fold_in(2), (2, 6, D))?];
    let rng = Some(key.fold_in(3));
    let (outputs, _) = layer.forward(&inputs, &init.params, &init.state, rng)?;
    let cts: Vec<CpuTensor> = outputs
        .iter()
        .enumerate()
        .map(|(i, y)| key.fold_in(10 + i as u64).normal::<B>(y.shape().clone(), 0.0, 1.0, DType::F64, &CpuDevice))
        .collect::<Result<_>>()?;

    let fused = layer.reverse_and_grad(&outputs, &cts, &init.params, &init.state, rng)?;
    let naive = naive_reverse_and_grad(layer, &outputs, &cts, &init.params, &init.state, rng)?;

    assert_close(&fused.inputs, &inputs, 1e-8)?;
    assert_close(&fused.inputs, &naive.inputs, 1e-8)?;
    assert_close(&fused.input_cts, &naive.input_cts, 1e-8)?;
    assert_eq!(fused.param_cts.leaf_count(), init.params.leaf_count());
    assert_close(&fused.param_cts.leaves(), &naive.param_cts.leaves(), 1e-8)
}

fn fail(e: strand_core::Error) -> TestCaseError {
    TestCaseError::fail(e.to_string())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn prop_half_residual_reverses_forward(seed in 0u64..10_000) {
        let layer = ReversibleHalfResidual::new(feed_forward());
        let (x, back) = round_trip(&layer, seed).map_err(fail)?;
        assert_close(&back, &x, 1e-9).map_err(fail)?;
    }

    #[test]
    fn prop_attention_half_residual_reverses_forward(seed in 0u64..10_000, share_qk in any::<bool>()) {
        let layer = attention_half(AttentionType::DotProductCausal, share_qk);
        let (x, back) = round_trip(&layer, seed).map_err(fail)?;
        assert_close(&back, &x, 1e-9).map_err(fail)?;
    }

    #[test]
    fn prop_reversible_serial_reverses_forward(seed in 0u64..10_000) {
        let layer = ReversibleSerial::new(blocks(2));
        let (x, back) = round_trip(&layer, seed).map_err(fail)?;
        assert_close(&back, &x, 1e-8).map_err(fail)?;
    }

    #[test]
    fn prop_half_residual_fused_matches_naive(seed in 0u64..10_000) {
        check_fused_matches_naive(&ReversibleHalfResidual::new(feed_forward()), seed).map_err(fail)?;
    }

    #[test]
    fn prop_attention_fused_matches_naive(seed in 0u64..10_000, share_qk in any::<bool>()) {
        let layer = attention_half(AttentionType::MemoryEfficientCausal, share_qk);
        check_fused_matches_naive(&layer, seed).map_err(fail)?;
    }
}

#[test]
fn test_reversible_serial_fused_matches_naive() -> Result<()> {
    check_fused_matches_naive(&ReversibleSerial::new(blocks(2)), 7)
}

#[test]
fn test_swap_fused_matches_naive() -> Result<()> {
    check_fused_matches_naive(&ReversibleSwap, 3)
}

#[test]
fn test_serial_backprop_matches_tape() -> Result<()> {
    let mut rev = blocks(2);
    rev.push(Box::new(SplitForOutput::new(2)));
    let head: Serial<B> = Serial::new(vec![Box::new(LayerNorm::new()), Box::new(Dense::new(5))]);
    let model: Serial<B> = Serial::new(vec![
        Box::new(Dense::new(D)),
        Box::new(Dup),
        Box::new(ReversibleSerial::new(rev)),
        Box::new(Map::new(Box::new(head), 2, true)?),
    ]);
    assert_eq!((model.n_in(), model.n_out()), (1, 2));

    let key = RngKey::new(21);
    let init = model.init(&[sig()], key, &CpuDevice)?;
    assert_eq!(init.output_sig[0].shape().dims(), &[2, 3, 5]);

    let x = randn(key.fold_in(1), (2, 6, D))?;
    let cts = vec![randn(key.fold_in(2), (2, 3, 5))?, randn(key.fold_in(3), (2, 3, 5))?];
    let rng = Some(key.fold_in(4));

    let efficient = model.backprop(&[x.clone()], &cts, &init.params, &init.state, rng)?;
    let tape = tape_backprop(&model, &[x], &cts, &init.params, &init.state, rng)?;
    assert_close(&efficient.outputs, &tape.outputs, 1e-9)?;
    assert_close(&efficient.input_cts, &tape.input_cts, 1e-8)?;
    assert_close(&efficient.param_cts.leaves(), &tape.param_cts.leaves(), 1e-8)?;
    Ok(())
}

#[test]
fn test_fused_attention_matches_tape() -> Result<()> {
    let key = RngKey::new(5);
    let qkv = vec![
        randn(key.fold_in(0), (3, 7, 4))?,
        randn(key.fold_in(1), (3, 7, 4))?,
        randn(key.fold_in(2), (3, 7, 4))?,
    ];
    let ct = randn(key.fold_in(3), (3, 7, 4))?;
    for kernel in [AttentionType::DotProductCausal, AttentionType::MemoryEfficientCausal] {
        let layer: Box<dyn FusedAttention<B>> = match kernel {
            AttentionType::MemoryEfficientCausal => {
                Box::new(strand_nn::MemoryEfficientCausalAttention::new(Mode::Train).with_loop_stride(3))
            }
            other => other.fused(Mode::Train),
        };
        let (out, cts) = layer.forward_and_backward(&qkv, &ct, None)?;
        let tape = tape_backprop(layer.as_ref(), &qkv, std::slice::from_ref(&ct), &Tree::empty(), &Tree::empty(), None)?;
        assert_close(&[out], &tape.outputs, 1e-10)?;
        assert_close(&cts, &tape.input_cts, 1e-9)?;
    }
    Ok(())
}

#[test]
#[should_panic(expected = "must have no params")]
fn test_param_free_sublayer_invariant_is_asserted() {
    let layer = ReversibleHalfResidual::<B>::new(feed_forward());
    let init = match layer.init(&[sig(), sig()], RngKey::new(0), &CpuDevice) {
        Ok(init) => init,
        Err(e) => panic!("init failed: {}", e),
    };
    // Give the add/subtract sublayer a parameter it should never have.
    let children = match &init.params {
        Tree::Node(c) => c.clone(),
        Tree::Leaf(_) => unreachable!(),
    };
    let bogus = match Tensor::zeros(1, DType::F64, &CpuDevice) {
        Ok(t) => t,
        Err(e) => panic!("{}", e),
    };
    let params = Tree::Node(vec![
        children[0].clone(),
        Tree::Node(vec![Tree::Node(vec![Tree::Leaf(bogus)]), Tree::empty()]),
    ]);
    let y: Vec<CpuTensor> = (0..2)
        .map(|i| randn(RngKey::new(i), (2, 6, D)))
        .collect::<Result<_>>()
        .unwrap_or_default();
    let _ = layer.reverse_and_grad(&y, &y, &params, &init.state, None);
}
