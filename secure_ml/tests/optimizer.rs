use secure_ml::{
    ErrKind, MlErr,
    optimization::{
        AdamW, AdamWConfig, ChannelMask, CompressDrop, CompressMask, Optimizer, select_channels,
    },
    params::{ParamId, ParamStore, Parameter},
    tensor::Tensor,
};

fn single(value: f32) -> (ParamStore, ParamId) {
    let mut store = ParamStore::new();
    let id = store.insert(Parameter::new("x", Tensor::from_vec(vec![value])));
    (store, id)
}

#[test]
fn invalid_hyperparameters_are_rejected() {
    let (_, id) = single(0.0);
    let base = AdamWConfig::default();

    let cases = [
        AdamWConfig { lr: -1e-3, ..base },
        AdamWConfig { eps: -1.0, ..base },
        AdamWConfig {
            betas: (1.0, 0.999),
            ..base
        },
        AdamWConfig {
            betas: (0.9, -0.1),
            ..base
        },
        AdamWConfig {
            weight_decay: -0.5,
            ..base
        },
    ];

    for config in cases {
        let err = AdamW::new(vec![id], config).unwrap_err();
        assert_eq!(err.kind(), ErrKind::Config, "{err}");
    }

    let err = AdamW::new(
        vec![id],
        AdamWConfig {
            betas: (0.9, 1.5),
            ..base
        },
    )
    .unwrap_err();
    assert!(matches!(err, MlErr::InvalidBeta { index: 1, value } if value == 1.5));

    assert!(AdamW::new(vec![id], base).is_ok());
}

#[test]
fn config_deserializes_with_defaults() {
    let config: AdamWConfig = serde_json::from_str(r#"{ "lr": 0.01, "amsgrad": true }"#).unwrap();

    assert_eq!(config.lr, 0.01);
    assert!(config.amsgrad);
    assert_eq!(config.betas, (0.9, 0.999));
    assert_eq!(config.weight_decay, 1e-2);
}

fn minimize_quadratic(config: AdamWConfig, steps: usize) -> f32 {
    let (mut store, id) = single(0.0);
    let mut opt = AdamW::new(vec![id], config).unwrap();

    for _ in 0..steps {
        let x = store.get(id).unwrap().data().item().unwrap();
        store
            .get_mut(id)
            .unwrap()
            .set_grad(Tensor::from_vec(vec![2.0 * (x - 5.0)]));
        opt.step(&mut store).unwrap();
    }

    store.get(id).unwrap().data().item().unwrap()
}

#[test]
fn default_config_moves_by_lr_per_step() {
    // Each step moves by about lr while the gradient keeps its sign, so
    // 500 steps of lr = 1e-3 cover about 0.5 of the 5.0 to go.
    let x = minimize_quadratic(AdamWConfig::default(), 500);
    assert!((x - 0.5).abs() < 0.05, "x = {x}");
}

#[test]
fn converges_on_a_quadratic_with_lr_0_1_and_no_decay() {
    let config = AdamWConfig {
        lr: 0.1,
        weight_decay: 0.0,
        ..Default::default()
    };

    let x = minimize_quadratic(config, 500);
    assert!((x - 5.0).abs() < 0.1, "x = {x}");
}

#[test]
fn amsgrad_second_moment_never_decreases() {
    let (mut store, id) = single(1.0);
    let config = AdamWConfig {
        lr: 0.01,
        amsgrad: true,
        ..Default::default()
    };
    let mut opt = AdamW::new(vec![id], config).unwrap();

    let mut prev = 0.0;
    for grad in [5.0, 0.1, 0.1, 3.0, 0.0, 0.0, 0.2] {
        store
            .get_mut(id)
            .unwrap()
            .set_grad(Tensor::from_vec(vec![grad]));
        opt.step(&mut store).unwrap();

        let max = opt.state(id).unwrap().max_exp_avg_sq().unwrap().item().unwrap();
        assert!(max >= prev);
        prev = max;
    }
}

#[test]
fn step_counter_counts_steps() {
    let (mut store, id) = single(1.0);
    let mut opt = AdamW::new(vec![id], AdamWConfig::default()).unwrap();

    for _ in 0..7 {
        store
            .get_mut(id)
            .unwrap()
            .set_grad(Tensor::from_vec(vec![0.3]));
        opt.step(&mut store).unwrap();
        opt.zero_grad(&mut store).unwrap();
    }

    assert_eq!(opt.state(id).unwrap().step(), 7);

    // No gradient, no step.
    opt.step(&mut store).unwrap();
    assert_eq!(opt.state(id).unwrap().step(), 7);
}

#[test]
fn step_survives_mask_compaction() {
    let mut store = ParamStore::new();
    let w = store.insert(Parameter::new("w", Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0])));
    let other = store.insert(Parameter::new("other", Tensor::from_vec(vec![1.0])));
    let mut opt = AdamW::new(vec![w, other], AdamWConfig::default()).unwrap();

    for _ in 0..4 {
        store
            .get_mut(w)
            .unwrap()
            .set_grad(Tensor::from_vec(vec![0.1, 0.2, 0.3, 0.4]));
        opt.step(&mut store).unwrap();
    }

    let mask = ChannelMask::new(0, vec![true, false, false, true]);
    let data = store.get(w).unwrap().data().select(0, &mask.kept_indices()).unwrap();
    let (w2, _) = store.replace(w, Parameter::new("w", data)).unwrap();

    opt.compress_mask(
        &store,
        CompressMask {
            var_old: w,
            var_new: w2,
            var_old_name: "w",
            var_new_name: "w",
            mask: &mask,
            mask_hook: select_channels,
            verbose: false,
        },
    )
    .unwrap();

    assert_eq!(opt.param_ids().collect::<Vec<_>>(), [w2, other]);

    store
        .get_mut(w2)
        .unwrap()
        .set_grad(Tensor::from_vec(vec![0.1, 0.4]));
    opt.step(&mut store).unwrap();
    assert_eq!(opt.state(w2).unwrap().step(), 5);
}

#[test]
fn stale_state_is_reported_instead_of_used() {
    let (mut store, id) = single(1.0);
    let mut opt = AdamW::new(vec![id], AdamWConfig::default()).unwrap();

    store
        .get_mut(id)
        .unwrap()
        .set_grad(Tensor::from_vec(vec![1.0]));
    opt.step(&mut store).unwrap();

    // Resize the parameter behind the optimizer's back.
    let param = store.get_mut(id).unwrap();
    *param.data_mut() = Tensor::from_vec(vec![1.0, 1.0]);
    param.set_grad(Tensor::from_vec(vec![1.0, 1.0]));

    let err = opt.step(&mut store).unwrap_err();
    assert!(matches!(err, MlErr::StateShapeMismatch { .. }));
    assert_eq!(err.kind(), ErrKind::Structural);
}

#[test]
fn dropped_params_leave_no_trace() {
    let mut store = ParamStore::new();
    let a = store.insert(Parameter::new("a", Tensor::from_vec(vec![1.0])));
    let b = store.insert(Parameter::new("b", Tensor::from_vec(vec![1.0])));
    let c = store.insert(Parameter::new("c", Tensor::from_vec(vec![1.0])));
    let mut opt = AdamW::new(vec![a, b, c], AdamWConfig::default()).unwrap();

    for id in [a, b, c] {
        store
            .get_mut(id)
            .unwrap()
            .set_grad(Tensor::from_vec(vec![1.0]));
    }
    opt.step(&mut store).unwrap();

    let drop_b = || CompressDrop {
        var_old: b,
        var_old_name: "b",
        verbose: true,
    };

    opt.compress_drop(&store, drop_b()).unwrap();
    assert!(opt.state(b).is_none());
    assert_eq!(opt.param_ids().collect::<Vec<_>>(), [a, c]);
    assert_eq!(opt.state(c).unwrap().step(), 1);

    let err = opt.compress_drop(&store, drop_b()).unwrap_err();
    assert!(matches!(err, MlErr::ParamNotFound { .. }));
}

#[test]
fn compacting_unknown_param_fails() {
    let (store, id) = single(1.0);
    let mut opt = AdamW::new(vec![id], AdamWConfig::default()).unwrap();
    let mask = ChannelMask::new(0, vec![true]);

    let mut other_store = ParamStore::new();
    other_store.insert(Parameter::new("pad", Tensor::from_vec(vec![0.0])));
    let untracked = other_store.insert(Parameter::new("y", Tensor::from_vec(vec![0.0])));

    let err = opt
        .compress_mask(
            &store,
            CompressMask {
                var_old: untracked,
                var_new: id,
                var_old_name: "y",
                var_new_name: "x",
                mask: &mask,
                mask_hook: select_channels,
                verbose: false,
            },
        )
        .unwrap_err();

    assert!(matches!(err, MlErr::ParamNotFound { param } if param == "y"));
    assert_eq!(opt.param_ids().collect::<Vec<_>>(), [id]);
}
