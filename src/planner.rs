use crate::prelude::*;

use crate::lxp::packet::MAX_REGISTERS_PER_READ;

pub const DEFAULT_MERGE_GAP: u16 = 8;
pub const DEFAULT_MAX_COUNT: u16 = 40;

/// A contiguous run of registers fetched with one read request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Bank {
    pub kind: RegisterKind,
    pub start: u16,
    pub count: u16,
}

impl Bank {
    pub fn new(kind: RegisterKind, start: u16, count: u16) -> Self {
        Self { kind, start, count }
    }

    /// Exclusive end.
    pub fn end(&self) -> u32 {
        self.start as u32 + self.count as u32
    }

    pub fn contains(&self, kind: RegisterKind, address: u16) -> bool {
        kind == self.kind && address >= self.start && (address as u32) < self.end()
    }
}

impl std::fmt::Display for Bank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{},{})", self.kind, self.start, self.end())
    }
}

/// Groups wanted registers into as few read requests as possible, bridging
/// holes of up to `merge_gap` unused registers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BankPlanner {
    merge_gap: u16,
    max_count: u16,
}

impl Default for BankPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_MERGE_GAP, DEFAULT_MAX_COUNT)
    }
}

impl BankPlanner {
    pub fn new(merge_gap: u16, max_count: u16) -> Self {
        Self {
            merge_gap,
            max_count: max_count.clamp(1, MAX_REGISTERS_PER_READ),
        }
    }

    pub fn max_count(&self) -> u16 {
        self.max_count
    }

    /// One bank per run of single registers.
    pub fn plan(&self, kind: RegisterKind, addresses: &[u16]) -> Vec<Bank> {
        let spans: Vec<(u16, u16)> = addresses.iter().map(|a| (*a, 1)).collect();
        self.plan_spans(kind, &spans)
    }

    /// `spans` are `(address, word_span)` pairs; a span is never split
    /// across two banks.
    pub fn plan_spans(&self, kind: RegisterKind, spans: &[(u16, u16)]) -> Vec<Bank> {
        let mut ranges: Vec<(u32, u32)> = spans
            .iter()
            .map(|(address, span)| {
                let start = *address as u32;
                (start, start + (*span).max(1) as u32)
            })
            .collect();
        ranges.sort_unstable();
        ranges.dedup();

        let gap = self.merge_gap as u32;
        let max = self.max_count as u32;

        let mut banks = Vec::new();
        let mut current: Option<(u32, u32)> = None;

        for (start, end) in ranges {
            current = match current {
                None => Some((start, end)),
                Some((cs, ce)) => {
                    if start <= ce + gap && end.max(ce) - cs <= max {
                        Some((cs, end.max(ce)))
                    } else if end <= ce {
                        // already fully covered
                        Some((cs, ce))
                    } else {
                        banks.push(Self::bank(kind, cs, ce));
                        // a multi-word value is never split, even if that
                        // means one register is read by both banks
                        Some((start, end))
                    }
                }
            };
        }

        if let Some((cs, ce)) = current {
            banks.push(Self::bank(kind, cs, ce));
        }

        banks
    }

    /// Hold banks first, then input. Switches always live in hold registers.
    pub fn plan_bindings(&self, bindings: &[RegisterBinding], switches: &[SwitchBinding]) -> Vec<Bank> {
        let mut hold: Vec<(u16, u16)> = switches.iter().map(|s| (s.address, 1)).collect();
        let mut input = Vec::new();

        for binding in bindings {
            let span = (binding.address, binding.word_span);
            match binding.register {
                RegisterKind::Hold => hold.push(span),
                RegisterKind::Input => input.push(span),
            }
        }

        let mut banks = self.plan_spans(RegisterKind::Hold, &hold);
        banks.extend(self.plan_spans(RegisterKind::Input, &input));

        debug!(
            "planned {} banks: {}",
            banks.len(),
            banks.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(" ")
        );

        banks
    }

    fn bank(kind: RegisterKind, start: u32, end: u32) -> Bank {
        Bank::new(kind, start as u16, (end - start) as u16)
    }
}
