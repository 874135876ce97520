//! Molecular structures as exposed by the format adapters.

use std::collections::HashMap;

/// A single atom of a structure.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Atom {
    /// 1-based atom index
    pub index: usize,
    /// Atomic number
    pub atomic_num: u32,
    /// Element symbol
    pub element: String,
    /// Partial charge
    pub partial_charge: f64,
    /// 1-based indices of bonded atoms
    pub bonded_atom_indices: Vec<usize>,
    /// Raw per-atom properties from the source file
    pub props: HashMap<String, String>,
}

impl Atom {
    /// Creates an atom from index and atomic number.
    pub fn new(index: usize, atomic_num: u32) -> Self {
        Self {
            index,
            atomic_num,
            element: atomic_number_to_symbol(atomic_num).to_string(),
            ..Default::default()
        }
    }

    /// Whether the atom takes part in charge comparison.
    ///
    /// Atoms without a `b_q_use_charge` property are used; atoms with the
    /// property set to `0` are not.
    pub fn use_for_charge(&self) -> bool {
        match self.props.get("b_q_use_charge") {
            Some(flag) => flag.trim() != "0",
            None => true,
        }
    }

    /// Atomic mass in amu.
    pub fn mass(&self) -> f64 {
        atomic_mass(self.atomic_num)
    }
}

/// Kind of a geometric term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermKind {
    /// Bond length between two atoms
    Bond,
    /// Angle over three atoms
    Angle,
    /// Torsion over four atoms
    Torsion,
}

impl TermKind {
    /// Number of atoms defining the term.
    pub fn atom_count(&self) -> usize {
        match self {
            TermKind::Bond => 2,
            TermKind::Angle => 3,
            TermKind::Torsion => 4,
        }
    }
}

/// A bond, angle or torsion measured in a structure.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometricTerm {
    /// Term kind
    pub kind: TermKind,
    /// 1-based atom indices
    pub atoms: Vec<usize>,
    /// Measured value (Å or degrees)
    pub value: f64,
    /// Comment naming the force-field substructure that defines the term
    pub comment: String,
}

/// One structure (frame) of a file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Structure {
    /// Structure-level properties
    pub props: HashMap<String, String>,
    /// Atoms in index order
    pub atoms: Vec<Atom>,
    /// Geometric terms, for listings that report them
    pub terms: Vec<GeometricTerm>,
}

impl Structure {
    /// Numeric value of a structure property.
    pub fn prop_f64(&self, name: &str) -> Option<f64> {
        self.props.get(name).and_then(|v| v.trim().parse().ok())
    }

    /// Atom by 1-based index.
    pub fn atom(&self, index: usize) -> Option<&Atom> {
        index
            .checked_sub(1)
            .and_then(|i| self.atoms.get(i))
            .filter(|a| a.index == index)
            .or_else(|| self.atoms.iter().find(|a| a.index == index))
    }

    /// Fills `bonded_atom_indices` from a list of bonds.
    pub fn connect(&mut self, bonds: &[(usize, usize)]) {
        for &(a, b) in bonds {
            for atom in self.atoms.iter_mut() {
                if atom.index == a && !atom.bonded_atom_indices.contains(&b) {
                    atom.bonded_atom_indices.push(b);
                } else if atom.index == b && !atom.bonded_atom_indices.contains(&a) {
                    atom.bonded_atom_indices.push(a);
                }
            }
        }
    }

    /// Indices of aliphatic hydrogens: hydrogens bonded to an sp3 carbon,
    /// i.e. a carbon with four neighbours.
    pub fn aliphatic_hydrogens(&self) -> Vec<usize> {
        self.atoms
            .iter()
            .filter(|atom| atom.atomic_num == 1)
            .filter(|atom| {
                atom.bonded_atom_indices.iter().any(|&i| {
                    self.atom(i)
                        .map(|partner| {
                            partner.atomic_num == 6 && partner.bonded_atom_indices.len() == 4
                        })
                        .unwrap_or(false)
                })
            })
            .map(|atom| atom.index)
            .collect()
    }

    /// Terms of a kind whose comment matches one of `sub_names`.
    pub fn select_terms<'a>(
        &'a self,
        kind: TermKind,
        sub_names: &'a [String],
    ) -> impl Iterator<Item = &'a GeometricTerm> + 'a {
        self.terms.iter().filter(move |term| {
            term.kind == kind && sub_names.iter().any(|name| term.comment.contains(name.as_str()))
        })
    }
}

/// Converts an atomic number to its element symbol.
pub fn atomic_number_to_symbol(atomic_num: u32) -> &'static str {
    ELEMENTS
        .get(atomic_num as usize)
        .map(|(symbol, _)| *symbol)
        .unwrap_or("X")
}

/// Converts an element symbol to its atomic number, ignoring case and any
/// trailing label digits (`C12` is carbon, `Pd1` is palladium).
///
/// Only exact symbols match; `Hx` is not hydrogen.
pub fn symbol_to_atomic_number(symbol: &str) -> Option<u32> {
    let letters: String = symbol.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    ELEMENTS
        .iter()
        .skip(1)
        .position(|(s, _)| s.eq_ignore_ascii_case(&letters))
        .map(|i| i as u32 + 1)
}

/// Standard atomic mass in amu; 0 for unknown elements.
pub fn atomic_mass(atomic_num: u32) -> f64 {
    ELEMENTS
        .get(atomic_num as usize)
        .map(|(_, mass)| *mass)
        .unwrap_or(0.0)
}

const ELEMENTS: [(&str, f64); 87] = [
    ("X", 0.0),
    ("H", 1.00794),
    ("He", 4.002602),
    ("Li", 6.941),
    ("Be", 9.012182),
    ("B", 10.811),
    ("C", 12.0107),
    ("N", 14.0067),
    ("O", 15.9994),
    ("F", 18.9984032),
    ("Ne", 20.1797),
    ("Na", 22.98976928),
    ("Mg", 24.3050),
    ("Al", 26.9815386),
    ("Si", 28.0855),
    ("P", 30.973762),
    ("S", 32.065),
    ("Cl", 35.453),
    ("Ar", 39.948),
    ("K", 39.0983),
    ("Ca", 40.078),
    ("Sc", 44.955912),
    ("Ti", 47.867),
    ("V", 50.9415),
    ("Cr", 51.9961),
    ("Mn", 54.938045),
    ("Fe", 55.845),
    ("Co", 58.933195),
    ("Ni", 58.6934),
    ("Cu", 63.546),
    ("Zn", 65.38),
    ("Ga", 69.723),
    ("Ge", 72.64),
    ("As", 74.92160),
    ("Se", 78.96),
    ("Br", 79.904),
    ("Kr", 83.798),
    ("Rb", 85.4678),
    ("Sr", 87.62),
    ("Y", 88.90585),
    ("Zr", 91.224),
    ("Nb", 92.90638),
    ("Mo", 95.96),
    ("Tc", 98.0),
    ("Ru", 101.07),
    ("Rh", 102.9055),
    ("Pd", 106.42),
    ("Ag", 107.8682),
    ("Cd", 112.411),
    ("In", 114.818),
    ("Sn", 118.71),
    ("Sb", 121.76),
    ("Te", 127.6),
    ("I", 126.90447),
    ("Xe", 131.293),
    ("Cs", 132.9054519),
    ("Ba", 137.327),
    ("La", 138.90547),
    ("Ce", 140.116),
    ("Pr", 140.90765),
    ("Nd", 144.242),
    ("Pm", 145.0),
    ("Sm", 150.36),
    ("Eu", 151.964),
    ("Gd", 157.25),
    ("Tb", 158.92535),
    ("Dy", 162.5),
    ("Ho", 164.93032),
    ("Er", 167.259),
    ("Tm", 168.93421),
    ("Yb", 173.054),
    ("Lu", 174.9668),
    ("Hf", 178.49),
    ("Ta", 180.94788),
    ("W", 183.84),
    ("Re", 186.207),
    ("Os", 190.23),
    ("Ir", 192.217),
    ("Pt", 195.084),
    ("Au", 196.966569),
    ("Hg", 200.59),
    ("Tl", 204.3833),
    ("Pb", 207.2),
    ("Bi", 208.9804),
    ("Po", 209.0),
    ("At", 210.0),
    ("Rn", 222.0),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn methane_like() -> Structure {
        // C1 with three hydrogens and one oxygen; O5 carries H6.
        let mut s = Structure {
            atoms: vec![
                Atom::new(1, 6),
                Atom::new(2, 1),
                Atom::new(3, 1),
                Atom::new(4, 1),
                Atom::new(5, 8),
                Atom::new(6, 1),
            ],
            ..Default::default()
        };
        s.connect(&[(1, 2), (1, 3), (1, 4), (1, 5), (5, 6)]);
        s
    }

    #[test]
    fn test_aliphatic_hydrogens() {
        let s = methane_like();
        assert_eq!(s.aliphatic_hydrogens(), vec![2, 3, 4]);
    }

    #[test]
    fn test_use_for_charge_flag() {
        let mut atom = Atom::new(1, 6);
        assert!(atom.use_for_charge());
        atom.props.insert("b_q_use_charge".to_string(), "0".to_string());
        assert!(!atom.use_for_charge());
        atom.props.insert("b_q_use_charge".to_string(), "1".to_string());
        assert!(atom.use_for_charge());
    }

    #[test]
    fn test_element_lookup() {
        assert_eq!(atomic_number_to_symbol(6), "C");
        assert_eq!(symbol_to_atomic_number("Cl"), Some(17));
        assert_eq!(symbol_to_atomic_number("C12"), Some(6));
        assert_eq!(symbol_to_atomic_number("h3"), Some(1));
        assert_eq!(symbol_to_atomic_number("12"), None);
        assert_eq!(symbol_to_atomic_number("Pd1"), Some(46));
        assert_eq!(symbol_to_atomic_number("Pt"), Some(78));
        assert_eq!(symbol_to_atomic_number("Ru"), Some(44));
        assert_eq!(symbol_to_atomic_number("Os"), Some(76));
        assert_eq!(symbol_to_atomic_number("Hx"), None);
        assert_eq!(symbol_to_atomic_number("X"), None);
        assert_eq!(atomic_number_to_symbol(86), "Rn");
        assert!((atomic_mass(46) - 106.42).abs() < 1e-6);
        assert!((atomic_mass(8) - 15.9994).abs() < 1e-6);
    }

    #[test]
    fn test_select_terms_by_substructure() {
        let s = Structure {
            terms: vec![
                GeometricTerm {
                    kind: TermKind::Bond,
                    atoms: vec![1, 2],
                    value: 1.09,
                    comment: "OPT Sub".to_string(),
                },
                GeometricTerm {
                    kind: TermKind::Bond,
                    atoms: vec![1, 5],
                    value: 1.43,
                    comment: "MM3 general".to_string(),
                },
                GeometricTerm {
                    kind: TermKind::Angle,
                    atoms: vec![2, 1, 3],
                    value: 109.5,
                    comment: "OPT Sub".to_string(),
                },
            ],
            ..Default::default()
        };
        let names = vec!["OPT".to_string()];
        let bonds: Vec<_> = s.select_terms(TermKind::Bond, &names).collect();
        assert_eq!(bonds.len(), 1);
        assert_eq!(bonds[0].atoms, vec![1, 2]);
    }
}
