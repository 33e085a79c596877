use crate::flow::{find_control_flow, transform_ir};
use crate::ir::{Expr, ExprId, Flow};
use crate::listing::Listing;

#[cfg(test)]
use crate::arch::RegisterArch;
#[cfg(test)]
use crate::decompiler::{Decompiler, Phase, SessionState};
#[cfg(test)]
use crate::error::DecompileError;
#[cfg(test)]
use crate::ir::SsaLink;
#[cfg(test)]
use crate::propagator::{propagate, NoPropagation, StackPropagationPolicy};
#[cfg(test)]
use crate::pruner::{is_prunable, prune, prune_to_fixed_point, verify_use_chains};
#[cfg(test)]
use crate::renamer::{rename, StackRenamer};
#[cfg(test)]
use crate::simplify::simplify_statement;
#[cfg(test)]
use crate::ssa::SsaTagger;

pub const SIMPLE_FRAME: &str = include_str!("../tests/simple_frame.listing");
pub const DIAMOND: &str = include_str!("../tests/diamond.listing");
pub const STACK_JOIN: &str = include_str!("../tests/stack_join.listing");
pub const OFFSETS: &str = include_str!("../tests/offsets.listing");

/// Parse `text` and lower it into IR form, without any SSA tagging
pub fn lift(text: &str) -> Flow {
    let listing = Listing::parse(text).unwrap();
    let mut flow = Flow::new(listing.entry_point().unwrap());
    find_control_flow(&mut flow, &listing).unwrap();
    transform_ir(&mut flow, &listing).unwrap();
    flow
}

/// The text of every live statement, in order
pub fn statement_texts(flow: &Flow) -> Vec<String> {
    flow.statements()
        .into_iter()
        .map(|s| flow.statement_text(s))
        .collect()
}

/// The `(lhs, rhs)` of the live assignment whose left-hand side renders as `lhs_text`
pub fn assignment(flow: &Flow, lhs_text: &str) -> (ExprId, ExprId) {
    flow.statements()
        .into_iter()
        .find_map(|s| match flow.expr(flow.statement(s).expr) {
            Expr::Assign { lhs, rhs } if flow.display(*lhs).to_string() == lhs_text => {
                Some((*lhs, *rhs))
            }
            _ => None,
        })
        .unwrap_or_else(|| panic!("No assignment to `{}`", lhs_text))
}

#[cfg(test)]
fn decompile(text: &str, until: Phase) -> (Flow, SessionState, Vec<Phase>) {
    let listing = Listing::parse(text).unwrap();
    let arch = RegisterArch::x86();
    let mut d = Decompiler::new(&listing, &arch, listing.entry_point().unwrap());
    d.advance_to(until).unwrap();
    (d.flow().clone(), d.session().clone(), d.phases().to_vec())
}

#[test]
fn listing_parses_directives_and_statements() {
    let listing = Listing::parse(SIMPLE_FRAME).unwrap();
    assert_eq!(listing.arch.as_deref(), Some("x86"));
    assert_eq!(listing.entry_point(), Some(0x1000));
    assert_eq!(listing.instructions().count(), 11);

    let listing = Listing::parse(DIAMOND).unwrap();
    assert_eq!(listing.entry, None);
    assert_eq!(listing.entry_point(), Some(0x2000));
}

#[test]
fn listing_errors_name_the_line() {
    let cases = [
        ("0x10: eax = 1\n0x10 eax = 2\n", 2),
        ("# nothing\n0x10: 5 = eax\n", 2),
        ("0x10: eax = 1\n0x10: eax = 2\n", 2),
        ("0x10: eax = (ebx\n", 1),
        ("0x10: eax = ebx $ 2\n", 1),
        ("0x10: goto eax\n", 1),
    ];
    for (text, expected_line) in cases {
        match Listing::parse(text) {
            Err(DecompileError::Listing { line, .. }) => assert_eq!(line, expected_line, "{}", text),
            r => panic!("Expected listing error for {:?}, got {:?}", text, r),
        }
    }
    assert!(matches!(
        Listing::parse("# only a comment\n"),
        Err(DecompileError::Listing { .. })
    ));
}

#[test]
fn comparison_operators_are_normalized() {
    let flow = lift("0x10: if eax > 3 goto 0x20\n0x12: return\n0x20: return 1 + 2 * 3\n");
    assert_eq!(
        statement_texts(&flow),
        vec!["if 3 < eax goto 0x20", "return", "return 1 + (2 * 3)"]
    );
}

#[test]
fn control_flow_recovery() {
    let flow = lift(DIAMOND);
    let blocks: Vec<(u64, Vec<u64>)> = flow
        .blocks()
        .map(|b| (b.address, b.successors.clone()))
        .collect();
    assert_eq!(
        blocks,
        vec![
            (0x2000, vec![0x2004, 0x2010]),
            (0x2004, vec![0x2014]),
            (0x2010, vec![0x2014]),
            (0x2014, vec![]),
        ]
    );
    assert_eq!(flow.predecessors(0x2014), vec![0x2004, 0x2010]);
    assert_eq!(flow.block(0x2004).unwrap().instructions, vec![0x2004, 0x2006, 0x2008]);
}

#[test]
fn control_flow_errors() {
    let listing = Listing::parse("0x10: eax = 1\n").unwrap();
    let mut flow = Flow::new(0x10);
    assert!(matches!(
        find_control_flow(&mut flow, &listing),
        Err(DecompileError::ControlFlow { address: 0x10, .. })
    ));

    let listing = Listing::parse("0x10: goto 0x99\n").unwrap();
    let mut flow = Flow::new(0x10);
    assert!(matches!(
        find_control_flow(&mut flow, &listing),
        Err(DecompileError::ControlFlow { address: 0x10, .. })
    ));

    let mut flow = Flow::new(0x11);
    assert!(matches!(
        find_control_flow(&mut flow, &listing),
        Err(DecompileError::ControlFlow { address: 0x11, .. })
    ));
}

#[test]
fn register_ssa_inserts_theta_at_join() {
    let arch = RegisterArch::x86();
    let mut flow = lift(STACK_JOIN);
    let stats = SsaTagger::new(&arch).tag_registers(&mut flow).unwrap();
    assert_eq!(
        statement_texts(&flow),
        vec![
            "esp@1 = esp@0 - 4",
            "if eax@0 == 0 goto 0x3004",
            "esp@2 = esp@1 - 4",
            "esp@3 = THETA(esp@1, esp@2)",
            "[esp@3] = 1",
            "return",
        ]
    );
    assert_eq!(stats.definitions, 2);
    assert_eq!(stats.thetas, 1);

    let (esp1, _) = assignment(&flow, "esp@1");
    assert_eq!(flow.uses_of(esp1).len(), 2);
    for &u in flow.uses_of(esp1) {
        assert_eq!(*flow.link(u), SsaLink::Use { definition: Some(esp1) });
    }
    verify_use_chains(&flow).unwrap();
}

#[test]
fn untagging_restores_ir_form() {
    let arch = RegisterArch::x86();
    let mut flow = lift(STACK_JOIN);
    let before = statement_texts(&flow);
    let tagger = SsaTagger::new(&arch);
    tagger.tag_registers(&mut flow).unwrap();
    tagger.untag(&mut flow);
    assert_eq!(statement_texts(&flow), before);
}

#[test]
fn stack_propagation_skips_theta_inputs() {
    let arch = RegisterArch::x86();
    let mut flow = lift(STACK_JOIN);
    SsaTagger::new(&arch).tag_registers(&mut flow).unwrap();
    let (esp1, _) = assignment(&flow, "esp@1");

    let stats = propagate(&mut flow, &StackPropagationPolicy::new(&arch)).unwrap();

    // The straight-line use is substituted; the theta inputs and the theta itself are not
    assert_eq!(stats.considered, 4);
    assert_eq!(stats.substitutions, 1);
    let texts = statement_texts(&flow);
    assert!(texts.contains(&"esp@2 = esp@0 - 8".to_owned()));
    assert!(texts.contains(&"esp@3 = THETA(esp@1, esp@2)".to_owned()));
    assert!(texts.contains(&"[esp@3] = 1".to_owned()));
    assert_eq!(flow.uses_of(esp1).len(), 1);
    verify_use_chains(&flow).unwrap();
}

#[test]
fn no_propagation_policy_changes_nothing() {
    let arch = RegisterArch::x86();
    let mut flow = lift(SIMPLE_FRAME);
    SsaTagger::new(&arch).tag_registers(&mut flow).unwrap();
    let before = statement_texts(&flow);
    let stats = propagate(&mut flow, &NoPropagation).unwrap();
    assert_eq!(stats.substitutions, 0);
    assert!(stats.considered > 0);
    assert_eq!(statement_texts(&flow), before);
}

#[test]
fn stack_propagation_folds_offsets() {
    let (flow, _, _) = decompile(SIMPLE_FRAME, Phase::StackPropagated);
    assert_eq!(
        statement_texts(&flow),
        vec![
            "esp@1 = esp@0 - 4",
            "[esp@0 - 4] = ebp@0",
            "esp@2 = esp@0 - 12",
            "[esp@0 - 8] = 1",
            "[esp@0 - 12] = 2",
            "eax@1 = [esp@0 - 8]",
            "eax@2 = eax@1 + [esp@0 - 12]",
            "esp@3 = esp@0 - 4",
            "ebp@1 = [esp@0 - 4]",
            "esp@4 = esp@0",
            "return eax@2",
        ]
    );
}

#[test]
fn deref_ssa_links_loads_to_stores() {
    let (flow, session, _) = decompile(SIMPLE_FRAME, Phase::SsaFormDerefs);
    let (store, _) = assignment(&flow, "[esp@0 - 12]@1");
    let (_, load) = assignment(&flow, "eax@2");
    let load = flow.children(load)[1];
    assert_eq!(flow.display(load).to_string(), "[esp@0 - 12]@1");
    assert_eq!(*flow.link(load), SsaLink::Use { definition: Some(store) });
    assert_eq!(session.restored_locations, vec!["ebp".to_owned()]);
}

#[test]
fn restored_locations_through_branches() {
    let (_, session, _) = decompile(DIAMOND, Phase::SsaFormDerefs);
    assert_eq!(session.restored_locations, vec!["ebx".to_owned()]);

    let (_, session, _) = decompile("0x10: eax = 1\n0x11: return eax\n", Phase::SsaFormDerefs);
    assert!(session.restored_locations.is_empty());
}

#[test]
fn calls_survive_pruning() {
    let (flow, session, _) = decompile(
        "0x10: eax = call 0x2000(ecx)\n\
         0x12: edx = ecx + 1\n\
         0x13: call 0x3000()\n\
         0x14: return\n",
        Phase::Pruned,
    );
    assert_eq!(
        statement_texts(&flow),
        vec!["eax@1 = call 0x2000(ecx@0)", "call 0x3000()", "return"]
    );
    assert_eq!(session.stats.pruned, 1);
}

#[test]
fn prunable_definitions() {
    let arch = RegisterArch::x86();
    let mut flow = lift(
        "0x10: eax = ebx + 1\n\
         0x11: [ecx] = 2\n\
         0x12: edx = call 0x2000()\n\
         0x13: esi = call 0x2000() + 1\n\
         0x14: return\n",
    );
    SsaTagger::new(&arch).tag_registers(&mut flow).unwrap();
    let stmts = flow.statements();
    assert!(is_prunable(&flow, stmts[0]));
    assert!(!is_prunable(&flow, stmts[1]));
    assert!(!is_prunable(&flow, stmts[2]));
    // A call nested below the top of the right-hand side still protects the statement
    assert_eq!(flow.statement_text(stmts[3]), "esi@1 = call 0x2000() + 1");
    assert!(!is_prunable(&flow, stmts[3]));
    assert!(!is_prunable(&flow, stmts[4]));
}

#[test]
fn single_pruning_pass_versus_fixed_point() {
    let text = "0x10: ecx = 1\n0x11: edx = ecx + 1\n0x12: return eax\n";
    let arch = RegisterArch::x86();

    let mut flow = lift(text);
    SsaTagger::new(&arch).tag_registers(&mut flow).unwrap();
    assert_eq!(prune(&mut flow), 1);
    assert_eq!(statement_texts(&flow), vec!["ecx@1 = 1", "return eax@0"]);
    verify_use_chains(&flow).unwrap();

    let mut flow = lift(text);
    SsaTagger::new(&arch).tag_registers(&mut flow).unwrap();
    assert_eq!(prune_to_fixed_point(&mut flow), 2);
    assert_eq!(statement_texts(&flow), vec!["return eax@0"]);
}

#[test]
fn broken_use_chains_are_reported() {
    let arch = RegisterArch::x86();
    let text = "0x10: eax = 1\n0x11: ebx = eax\n0x12: return ebx\n";

    let mut flow = lift(text);
    SsaTagger::new(&arch).tag_registers(&mut flow).unwrap();
    let (eax1, _) = assignment(&flow, "eax@1");
    flow.set_link(eax1, SsaLink::Definition { uses: vec![] });
    assert!(matches!(
        verify_use_chains(&flow),
        Err(DecompileError::InconsistentUses { .. })
    ));

    let mut flow = lift(text);
    SsaTagger::new(&arch).tag_registers(&mut flow).unwrap();
    let (_, use_site) = assignment(&flow, "ebx@1");
    flow.set_link(use_site, SsaLink::Use { definition: None });
    assert!(matches!(
        propagate(&mut flow, &NoPropagation),
        Err(DecompileError::InconsistentUses { .. })
    ));
}

#[test]
fn simplifier_folds_and_canonicalizes() {
    let mut flow = lift(
        "0x10: eax = esp + 4 - 4\n\
         0x11: ebx = 2 + 3 * 4\n\
         0x12: ecx = 4 + esp\n\
         0x13: edx = esp + -8\n\
         0x14: esi = !0 + -(2)\n\
         0x15: return\n",
    );
    let mut rewrites = 0;
    for s in flow.statements() {
        rewrites += simplify_statement(&mut flow, s);
    }
    assert_eq!(
        statement_texts(&flow),
        vec![
            "eax = esp",
            "ebx = 14",
            "ecx = esp + 4",
            "edx = esp - 8",
            "esi = -1",
            "return",
        ]
    );
    assert!(rewrites >= 6);
}

#[test]
fn stack_offsets_map_to_one_variable_each() {
    let arch = RegisterArch::x86();
    let mut flow = lift(OFFSETS);
    let mut session = SessionState::default();
    let renamed = rename(&mut flow, &mut StackRenamer::new(&arch, &mut session)).unwrap();
    assert_eq!(renamed, 5);
    assert_eq!(
        statement_texts(&flow),
        vec!["s0 = 1", "s1 = 2", "eax = s1", "s2 = eax", "ebx = s0", "return ebx"]
    );
    assert_eq!(
        session.stack_variables(),
        vec![(0, "s0".to_owned()), (4, "s1".to_owned()), (-8, "s2".to_owned())]
    );

    // Renaming again within the same session never allocates new variables
    let mut flow = lift(OFFSETS);
    rename(&mut flow, &mut StackRenamer::new(&arch, &mut session)).unwrap();
    assert_eq!(session.stack_variables().len(), 3);
    assert_eq!(session.variable_for_offset(-8).as_deref(), Some("s2"));
    assert_eq!(session.variable_for_offset(12), None);
}

#[test]
fn bare_stack_addresses_become_address_of() {
    let arch = RegisterArch::x86();
    let mut flow = lift("0x10: eax = esp\n0x11: ecx = esp + 8\n0x12: [esp + 8] = 3\n0x13: return\n");
    let mut session = SessionState::default();
    rename(&mut flow, &mut StackRenamer::new(&arch, &mut session)).unwrap();
    assert_eq!(
        statement_texts(&flow),
        vec!["eax = &s0", "ecx = &s1", "s1 = 3", "return"]
    );

    let (_, rhs) = assignment(&flow, "ecx");
    match flow.expr(rhs) {
        Expr::Address(var) => match flow.expr(*var) {
            Expr::Var { name, index, origin } => {
                assert_eq!(name, "s1");
                assert_eq!(*index, None);
                assert_eq!(flow.display(*origin).to_string(), "esp + 8");
                assert!(!flow.is_live(*origin));
            }
            e => panic!("Expected a variable, got {:?}", e),
        },
        e => panic!("Expected an address-of, got {:?}", e),
    }
}

#[test]
fn stack_location_shapes() {
    let arch = RegisterArch::x86();
    let flow = lift(
        "0x10: eax = [esp - 8]\n\
         0x11: ebx = [ebx + 4]\n\
         0x12: ecx = esp\n\
         0x13: return\n",
    );
    let mut session = SessionState::default();
    let renamer = StackRenamer::new(&arch, &mut session);

    let (_, rhs) = assignment(&flow, "eax");
    assert_eq!(renamer.find_stack_location(&flow, rhs).unwrap(), -8);
    let (_, rhs) = assignment(&flow, "ecx");
    assert_eq!(renamer.find_stack_location(&flow, rhs).unwrap(), 0);

    let (_, rhs) = assignment(&flow, "ebx");
    match renamer.find_stack_location(&flow, rhs) {
        Err(DecompileError::UnrecognizedStackLocation {
            operand, address, ..
        }) => {
            assert_eq!(operand, "[ebx + 4]");
            assert_eq!(address, 0x11);
        }
        r => panic!("Expected unrecognized stack location, got {:?}", r),
    }
}

#[test]
fn full_pipeline_recovers_stack_variables() {
    let (flow, session, phases) = decompile(SIMPLE_FRAME, Phase::last());
    assert_eq!(phases, Phase::ALL.to_vec());
    assert_eq!(
        statement_texts(&flow),
        vec![
            "s0@1 = ebp@0",
            "s1@1 = 1",
            "s2@1 = 2",
            "eax@1 = s1",
            "eax@2 = eax@1 + s2",
            "return eax@2",
        ]
    );
    assert_eq!(
        session.stack_variables(),
        vec![(-4, "s0".to_owned()), (-8, "s1".to_owned()), (-12, "s2".to_owned())]
    );
    assert_eq!(session.stats.pruned, 5);
    assert_eq!(session.stats.renamed, 5);

    // Renamed variables keep their definition links
    let (s1, _) = assignment(&flow, "s1@1");
    let (_, load) = assignment(&flow, "eax@1");
    assert_eq!(*flow.link(load), SsaLink::Use { definition: Some(s1) });
}

#[test]
fn stack_reads_drop_their_index() {
    let text = "0x10: [esp + 4] = 1\n0x11: eax = [esp + 4]\n0x12: return eax\n";
    let (flow, _, _) = decompile(text, Phase::last());
    assert_eq!(
        statement_texts(&flow),
        vec!["s0@1 = 1", "eax@1 = s0", "return eax@1"]
    );
    let (def, _) = assignment(&flow, "s0@1");
    let (_, read) = assignment(&flow, "eax@1");
    assert_eq!(*flow.link(read), SsaLink::Use { definition: Some(def) });
    verify_use_chains(&flow).unwrap();
}

#[test]
fn full_pipeline_keeps_theta_inputs() {
    let (flow, session, _) = decompile(STACK_JOIN, Phase::last());
    assert_eq!(
        statement_texts(&flow),
        vec![
            "esp@1 = &s0",
            "if eax@0 == 0 goto 0x3004",
            "esp@2 = &s1",
            "esp@3 = THETA(esp@1, esp@2)",
            "s2@1 = 1",
            "return",
        ]
    );
    assert_eq!(
        session.stack_variables(),
        vec![(-4, "s0".to_owned()), (-8, "s1".to_owned()), (0, "s2".to_owned())]
    );
    let (esp1, _) = assignment(&flow, "esp@1");
    assert_eq!(flow.uses_of(esp1).len(), 1);
    verify_use_chains(&flow).unwrap();
}

#[test]
fn full_pipeline_over_branches() {
    let (flow, session, _) = decompile(DIAMOND, Phase::last());
    assert_eq!(
        statement_texts(&flow),
        vec![
            "s0@1 = ebx@0",
            "if eax@0 == 0 goto 0x2010",
            "ebx@1 = 5",
            "eax@1 = ebx@1 + 1",
            "goto 0x2014",
            "ebx@2 = 7",
            "eax@2 = ebx@2",
            "eax@3 = THETA(eax@1, eax@2)",
            "return eax@3",
        ]
    );
    assert_eq!(session.stats.pruned, 3);
    assert_eq!(session.stats.register_tags.thetas, 1);
}

#[test]
fn phases_run_once_and_in_order() {
    let listing = Listing::parse(DIAMOND).unwrap();
    let arch = RegisterArch::x86();
    let mut d = Decompiler::new(&listing, &arch, 0x2000);
    assert_eq!(d.phases(), &[Phase::NothingDone]);

    d.advance_to(Phase::SsaFormRegisters).unwrap();
    let dump = format!("{:?}", d.flow().debug_flow());
    let phases = d.phases().to_vec();
    assert_eq!(
        phases,
        vec![
            Phase::NothingDone,
            Phase::BasicBlocks,
            Phase::IrForm,
            Phase::SsaFormRegisters
        ]
    );

    d.advance_to(Phase::SsaFormRegisters).unwrap();
    d.advance_to(Phase::IrForm).unwrap();
    assert_eq!(format!("{:?}", d.flow().debug_flow()), dump);
    assert_eq!(d.phases(), phases.as_slice());

    assert_eq!(d.step().unwrap(), Some(Phase::StackPropagated));
    d.run_to_completion().unwrap();
    assert_eq!(d.current_phase(), Phase::StackRenamed);
    assert_eq!(d.step().unwrap(), None);
    assert_eq!(d.phases(), Phase::ALL.as_slice());
}

#[test]
fn failed_phase_aborts_session() {
    let listing = Listing::parse(SIMPLE_FRAME).unwrap();
    let arch = RegisterArch::x86();
    let mut d = Decompiler::new(&listing, &arch, 0x9999);
    match d.step() {
        Err(DecompileError::PhaseFailed { phase, source }) => {
            assert_eq!(phase, Phase::BasicBlocks);
            assert!(matches!(*source, DecompileError::ControlFlow { address: 0x9999, .. }));
        }
        r => panic!("Expected phase failure, got {:?}", r),
    }
    assert!(matches!(
        d.advance_to(Phase::last()),
        Err(DecompileError::SessionAborted { phase: Phase::BasicBlocks })
    ));
    assert!(matches!(d.step(), Err(DecompileError::SessionAborted { .. })));
    assert_eq!(d.phases(), &[Phase::NothingDone]);
}

#[test]
fn phase_names_round_trip() {
    for p in Phase::ALL {
        assert_eq!(p.name().parse::<Phase>(), Ok(p));
    }
    assert!("nonsense".parse::<Phase>().is_err());
    assert_eq!(Phase::NothingDone.next(), Some(Phase::BasicBlocks));
    assert_eq!(Phase::last().next(), None);
    assert_eq!(
        Phase::StackPropagated.to_string(),
        "Stack variable is propagated"
    );
}

#[test]
fn block_graph_as_dot() {
    let flow = lift(DIAMOND);
    let dot = flow.generate_dot();
    assert!(dot.contains("digraph flow_2000"));
    assert!(dot.contains("b2000 -> b2004"));
    assert!(dot.contains("b2000 -> b2010"));
    assert!(dot.contains("b2010 -> b2014"));
}
